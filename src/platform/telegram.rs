use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use teloxide::payloads::GetUpdatesSetters;
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, UpdateKind};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{MessageId, MessageSource, RelayMessage, Sender};

/// Bot API maximum for a single getUpdates call
const UPDATES_PER_CALL: u8 = 100;
/// Long-poll timeout used by the live subscription
const LONG_POLL_SECS: u32 = 10;
/// Messages kept in memory so history pages can be answered
const BUFFER_CAPACITY: usize = 10_000;
/// Pause when the queue head is held back by an unhandled message
const STALLED_POLL_DELAY: Duration = Duration::from_secs(2);

/// Messages drained from the Bot API update queue for one chat, keyed by id,
/// plus the bookkeeping that decides which updates may be confirmed.
///
/// The Bot API has no history endpoint: whatever Telegram still holds in the
/// pending update queue (at most 24 hours) is all a bot can ever see. Any
/// getUpdates call with `offset = n` confirms every update below `n` and
/// Telegram forgets it, so the offset only moves past updates that carry no
/// message for this chat or whose message is at or below the acknowledged
/// cursor. Everything else stays in Telegram's queue until it is relayed.
#[derive(Default)]
struct UpdateBuffer {
    /// Offset for the next getUpdates call
    offset: Option<i32>,
    acked: MessageId,
    /// Seen but not yet confirmed, by update id. `None` when the update is
    /// irrelevant to this chat or already handled.
    unconfirmed: BTreeMap<i32, Option<MessageId>>,
    messages: BTreeMap<MessageId, RelayMessage>,
}

impl UpdateBuffer {
    /// Returns true if the message was not already buffered.
    fn insert(&mut self, message: RelayMessage) -> bool {
        let fresh = self.messages.insert(message.id, message).is_none();
        while self.messages.len() > BUFFER_CAPACITY {
            self.messages.pop_first();
        }
        fresh
    }

    /// Take note of one update. Returns its message if it is new and not yet
    /// handled.
    fn record(&mut self, update_id: i32, message: Option<RelayMessage>) -> Option<RelayMessage> {
        if self.offset.is_some_and(|offset| update_id < offset) {
            return None;
        }
        let fresh = match message {
            Some(message) if message.id > self.acked => {
                self.unconfirmed.insert(update_id, Some(message.id));
                self.insert(message.clone()).then_some(message)
            }
            _ => {
                self.unconfirmed.insert(update_id, None);
                None
            }
        };
        self.advance_offset();
        fresh
    }

    fn acknowledge(&mut self, cursor: MessageId) {
        self.acked = self.acked.max(cursor);
        self.advance_offset();
    }

    /// Move the offset past the leading run of updates that are safe to drop.
    fn advance_offset(&mut self) {
        while let Some((&update_id, &message_id)) = self.unconfirmed.first_key_value() {
            if message_id.is_some_and(|id| id > self.acked) {
                break;
            }
            self.unconfirmed.pop_first();
            self.offset = Some(update_id.saturating_add(1));
        }
    }

    /// Newest-first slice of ids in `(min_id, offset_id)`, at most `limit` long.
    fn page(
        &self,
        min_id: MessageId,
        limit: usize,
        offset_id: Option<MessageId>,
    ) -> Vec<RelayMessage> {
        if offset_id.is_some_and(|offset| offset <= min_id) {
            return Vec::new();
        }
        let upper = match offset_id {
            Some(offset) => Bound::Excluded(offset),
            None => Bound::Unbounded,
        };
        self.messages
            .range((Bound::Excluded(min_id), upper))
            .rev()
            .take(limit)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

/// Result of one getUpdates round trip
struct PollBatch {
    updates: usize,
    fresh: Vec<RelayMessage>,
    /// Whether the confirm offset moved during this batch
    advanced: bool,
}

/// Reads a single chat through the Telegram Bot API.
pub struct TelegramSource {
    bot: Bot,
    chat_id: ChatId,
    buffer: Arc<Mutex<UpdateBuffer>>,
}

impl TelegramSource {
    pub fn new(bot_token: &str, chat_id: i64) -> Self {
        Self::with_bot(Bot::new(bot_token), chat_id)
    }

    pub fn with_bot(bot: Bot, chat_id: i64) -> Self {
        Self {
            bot,
            chat_id: ChatId(chat_id),
            buffer: Arc::new(Mutex::new(UpdateBuffer::default())),
        }
    }

    /// Pull pending updates into the buffer. Stops early when the next page
    /// could only be read by confirming messages that are not handled yet.
    async fn drain(&self) -> Result<usize> {
        let mut fresh = 0;
        loop {
            let batch = poll_updates(&self.bot, self.chat_id, &self.buffer, 0).await?;
            fresh += batch.fresh.len();
            if batch.updates < UPDATES_PER_CALL as usize || !batch.advanced {
                return Ok(fresh);
            }
        }
    }
}

async fn poll_updates(
    bot: &Bot,
    chat_id: ChatId,
    buffer: &Mutex<UpdateBuffer>,
    timeout_secs: u32,
) -> Result<PollBatch> {
    let offset = buffer.lock().await.offset;

    let mut request = bot
        .get_updates()
        .limit(UPDATES_PER_CALL)
        .timeout(timeout_secs)
        .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::ChannelPost]);
    if let Some(offset) = offset {
        request = request.offset(offset);
    }

    let updates = request.await.context("Telegram getUpdates request failed")?;

    let mut buffer = buffer.lock().await;
    let mut fresh = Vec::new();
    let count = updates.len();
    for update in updates {
        let update_id = i32::try_from(update.id.0)
            .with_context(|| format!("Telegram update id {} out of range", update.id.0))?;
        let message = match update.kind {
            UpdateKind::Message(message) | UpdateKind::ChannelPost(message) => {
                if message.chat.id == chat_id {
                    Some(to_relay_message(&message))
                } else {
                    debug!("Ignoring message from chat {}", message.chat.id.0);
                    None
                }
            }
            _ => None,
        };
        if let Some(message) = buffer.record(update_id, message) {
            fresh.push(message);
        }
    }
    Ok(PollBatch {
        updates: count,
        fresh,
        advanced: buffer.offset != offset,
    })
}

fn to_relay_message(message: &Message) -> RelayMessage {
    RelayMessage {
        id: i64::from(message.id.0),
        date: message.date,
        sender: resolve_sender(message),
        text: message
            .text()
            .or_else(|| message.caption())
            .map(str::to_string),
    }
}

/// `sender_chat` wins over `from`: anonymous admins and channel posts carry a
/// placeholder user in `from`.
fn resolve_sender(message: &Message) -> Sender {
    if let Some(title) = message.sender_chat.as_ref().and_then(|chat| chat.title()) {
        return Sender::Channel {
            title: title.to_string(),
        };
    }
    match message.from.as_ref() {
        Some(user) => Sender::Person {
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
        },
        None => Sender::Unknown,
    }
}

#[async_trait]
impl MessageSource for TelegramSource {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn connect(&self) -> Result<()> {
        let me = self
            .bot
            .get_me()
            .await
            .context("Failed to authenticate with Telegram (getMe)")?;
        info!(
            "Connected to Telegram as {} (@{}), watching chat {}",
            me.first_name,
            me.username.as_deref().unwrap_or("-"),
            self.chat_id.0
        );
        Ok(())
    }

    async fn fetch_messages(
        &self,
        min_id: MessageId,
        limit: usize,
        offset_id: Option<MessageId>,
    ) -> Result<Vec<RelayMessage>> {
        let fresh = self.drain().await?;
        if fresh > 0 {
            debug!("Buffered {} new message(s) from the update queue", fresh);
        }
        Ok(self.buffer.lock().await.page(min_id, limit, offset_id))
    }

    fn subscribe(&self) -> BoxStream<'static, Result<RelayMessage>> {
        let bot = self.bot.clone();
        let chat_id = self.chat_id;
        let buffer = Arc::clone(&self.buffer);

        stream::unfold(VecDeque::new(), move |mut pending| {
            let bot = bot.clone();
            let buffer = Arc::clone(&buffer);
            async move {
                loop {
                    if let Some(message) = pending.pop_front() {
                        return Some((Ok(message), pending));
                    }
                    match poll_updates(&bot, chat_id, &buffer, LONG_POLL_SECS).await {
                        Ok(batch) => {
                            let stalled =
                                batch.updates > 0 && batch.fresh.is_empty() && !batch.advanced;
                            pending.extend(batch.fresh);
                            if stalled {
                                tokio::time::sleep(STALLED_POLL_DELAY).await;
                            }
                        }
                        Err(e) => return Some((Err(e), pending)),
                    }
                }
            }
        })
        .boxed()
    }

    async fn acknowledge(&self, cursor: MessageId) -> Result<()> {
        self.buffer.lock().await.acknowledge(cursor);
        Ok(())
    }

    /// Confirm the updates that are safe to drop so Telegram stops resending
    /// them. Unhandled messages stay queued for the next activation.
    async fn disconnect(&self) -> Result<()> {
        let offset = self.buffer.lock().await.offset;
        if let Some(offset) = offset {
            debug!("Confirming Telegram updates below {}", offset);
            self.bot
                .get_updates()
                .offset(offset)
                .limit(1)
                .timeout(0)
                .await
                .context("Failed to confirm consumed Telegram updates")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBotApi;
    use chrono::Utc;

    const CHAT: i64 = 555;
    const OTHER_CHAT: i64 = 777;

    fn msg(id: MessageId) -> RelayMessage {
        RelayMessage {
            id,
            date: Utc::now(),
            sender: Sender::Unknown,
            text: Some(format!("message {}", id)),
        }
    }

    fn buffer_with(ids: &[MessageId]) -> UpdateBuffer {
        let mut buffer = UpdateBuffer::default();
        for &id in ids {
            buffer.insert(msg(id));
        }
        buffer
    }

    fn ids(page: &[RelayMessage]) -> Vec<MessageId> {
        page.iter().map(|m| m.id).collect()
    }

    fn source(api: &FakeBotApi) -> TelegramSource {
        TelegramSource::with_bot(api.bot(), CHAT)
    }

    #[test]
    fn test_page_is_newest_first_and_respects_limit() {
        let buffer = buffer_with(&[1, 2, 3, 4, 5]);
        assert_eq!(ids(&buffer.page(0, 3, None)), vec![5, 4, 3]);
    }

    #[test]
    fn test_page_bounds_are_exclusive() {
        let buffer = buffer_with(&[1, 2, 3, 4, 5]);
        assert_eq!(ids(&buffer.page(2, 10, Some(5))), vec![4, 3]);
    }

    #[test]
    fn test_page_with_collapsed_range_is_empty() {
        let buffer = buffer_with(&[1, 2, 3]);
        assert!(buffer.page(3, 10, Some(3)).is_empty());
        assert!(buffer.page(3, 10, Some(2)).is_empty());
        assert!(buffer.page(2, 10, Some(3)).is_empty());
    }

    #[test]
    fn test_insert_reports_duplicates() {
        let mut buffer = UpdateBuffer::default();
        assert!(buffer.insert(msg(7)));
        assert!(!buffer.insert(msg(7)));
    }

    #[test]
    fn test_buffer_evicts_oldest_beyond_capacity() {
        let mut buffer = UpdateBuffer::default();
        for id in 1..=(BUFFER_CAPACITY as MessageId + 5) {
            buffer.insert(msg(id));
        }
        assert_eq!(buffer.messages.len(), BUFFER_CAPACITY);
        assert_eq!(buffer.messages.keys().next(), Some(&6));
    }

    #[test]
    fn test_offset_stops_at_first_unhandled_message() {
        let mut buffer = UpdateBuffer::default();
        buffer.acknowledge(100);
        buffer.record(1, None);
        buffer.record(2, Some(msg(90)));
        buffer.record(3, Some(msg(101)));
        buffer.record(4, None);
        assert_eq!(buffer.offset, Some(3));

        buffer.acknowledge(101);
        assert_eq!(buffer.offset, Some(5));
    }

    #[test]
    fn test_already_confirmed_updates_are_ignored() {
        let mut buffer = UpdateBuffer::default();
        buffer.record(1, None);
        assert_eq!(buffer.record(1, Some(msg(5))), None);
        assert_eq!(buffer.offset, Some(2));
    }

    #[tokio::test]
    async fn test_pending_updates_become_history_pages() {
        let api = FakeBotApi::spawn().await;
        api.push_message(CHAT, 101);
        api.push_message(OTHER_CHAT, 500);
        api.push_message(CHAT, 102);
        api.push_message(CHAT, 103);
        let source = source(&api);

        let page = source.fetch_messages(100, 100, None).await.unwrap();

        assert_eq!(ids(&page), vec![103, 102, 101]);
        assert_eq!(page[0].text.as_deref(), Some("message 103"));
        assert_eq!(page[0].sender.display_name(), "Ann Lee");
    }

    #[tokio::test]
    async fn test_disconnect_confirms_only_up_to_acknowledged_cursor() {
        let api = FakeBotApi::spawn().await;
        for id in [101, 102, 103] {
            api.push_message(CHAT, id);
        }
        let source = source(&api);

        source.fetch_messages(100, 100, None).await.unwrap();
        source.acknowledge(101).await.unwrap();
        source.disconnect().await.unwrap();

        assert_eq!(api.pending_message_ids(), vec![102, 103]);
        assert!(api.offsets().iter().all(|o| o.map_or(true, |o| o <= 2)));
    }

    #[tokio::test]
    async fn test_disconnect_without_acknowledgement_confirms_nothing() {
        let api = FakeBotApi::spawn().await;
        api.push_message(CHAT, 101);
        let source = source(&api);

        source.fetch_messages(0, 100, None).await.unwrap();
        source.disconnect().await.unwrap();

        assert_eq!(api.pending_message_ids(), vec![101]);
    }

    #[tokio::test]
    async fn test_other_chats_are_confirmed_without_relaying() {
        let api = FakeBotApi::spawn().await;
        api.push_message(OTHER_CHAT, 1);
        api.push_message(OTHER_CHAT, 2);
        api.push_message(CHAT, 10);
        let source = source(&api);

        let page = source.fetch_messages(0, 100, None).await.unwrap();
        source.disconnect().await.unwrap();

        assert_eq!(ids(&page), vec![10]);
        assert_eq!(api.pending_message_ids(), vec![10]);
    }

    #[tokio::test]
    async fn test_backlog_beyond_one_call_is_read_after_acknowledgement() {
        let api = FakeBotApi::spawn().await;
        for id in 1..=150 {
            api.push_message(CHAT, id);
        }
        let source = source(&api);

        let first = source.fetch_messages(0, 200, None).await.unwrap();
        assert_eq!(first.len(), 100);
        assert_eq!(first[0].id, 100);

        source.acknowledge(100).await.unwrap();
        let second = source.fetch_messages(100, 200, None).await.unwrap();
        assert_eq!(ids(&second), (101..=150).rev().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_subscribe_yields_each_new_message_once() {
        let api = FakeBotApi::spawn().await;
        api.push_message(CHAT, 101);
        let source = source(&api);
        let mut stream = source.subscribe();
        let wait = Duration::from_secs(5);

        let first = tokio::time::timeout(wait, stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.id, 101);
        source.acknowledge(101).await.unwrap();

        api.push_message(OTHER_CHAT, 900);
        api.push_message(CHAT, 102);
        let second = tokio::time::timeout(wait, stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.id, 102);
    }
}
