//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::Uri;
use axum::{Json, Router};
use chrono::{FixedOffset, TimeZone, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use teloxide::Bot;
use tokio::time::Instant;

use crate::cursor::{Cursor, CursorStore};
use crate::pipeline::Pipeline;
use crate::platform::{MessageId, MessageSource, RelayMessage, Sender};
use crate::webhook::{DispatchOutcome, Dispatcher, Formatter, Sink, TargetKind};

pub fn message(id: MessageId) -> RelayMessage {
    RelayMessage {
        id,
        date: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(id),
        sender: Sender::Person {
            first_name: "Test".to_string(),
            last_name: None,
        },
        text: Some(format!("message {}", id)),
    }
}

pub async fn pipeline(sink: &RecordingSink, store: &MemoryCursorStore) -> Pipeline {
    pipeline_with_interval(sink, store, Duration::ZERO).await
}

pub async fn pipeline_with_interval(
    sink: &RecordingSink,
    store: &MemoryCursorStore,
    interval: Duration,
) -> Pipeline {
    let formatter = Formatter::new(
        TargetKind::Generic,
        "Relay",
        FixedOffset::east_opt(0).unwrap(),
    );
    let dispatcher = Dispatcher::new(Box::new(sink.clone()), interval);
    let cursor = Cursor::open(Box::new(store.clone())).await;
    Pipeline::new(formatter, dispatcher, cursor)
}

#[derive(Default)]
struct CursorState {
    value: Option<MessageId>,
    writes: Vec<MessageId>,
    failing: bool,
}

#[derive(Clone, Default)]
pub struct MemoryCursorStore {
    state: Arc<Mutex<CursorState>>,
}

impl MemoryCursorStore {
    pub fn with_value(value: MessageId) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().value = Some(value);
        store
    }

    pub fn value(&self) -> Option<MessageId> {
        self.state.lock().unwrap().value
    }

    pub fn writes(&self) -> Vec<MessageId> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self) -> Result<Option<MessageId>> {
        Ok(self.value())
    }

    async fn save(&self, id: MessageId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing {
            anyhow::bail!("disk full");
        }
        state.value = Some(id);
        state.writes.push(id);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Default)]
struct SinkState {
    sent: Vec<(Instant, Value)>,
    outcomes: VecDeque<DispatchOutcome>,
}

/// Records every payload it receives. Answers with queued outcomes, then
/// `Delivered` once the queue is empty.
#[derive(Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    pub fn push_outcome(&self, outcome: DispatchOutcome) {
        self.state.lock().unwrap().outcomes.push_back(outcome);
    }

    pub fn send_times(&self) -> Vec<Instant> {
        self.state.lock().unwrap().sent.iter().map(|(t, _)| *t).collect()
    }

    /// Message ids of every attempted send, read back out of the payloads.
    pub fn sent_ids(&self) -> Vec<MessageId> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter_map(|(_, payload)| {
                let text = payload["markdown"]["text"].as_str()?;
                let (_, rest) = text.split_once("**Message ID:** ")?;
                rest.lines().next()?.trim().parse().ok()
            })
            .collect()
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn deliver(&self, payload: &Value) -> DispatchOutcome {
        let mut state = self.state.lock().unwrap();
        state.sent.push((Instant::now(), payload.clone()));
        state
            .outcomes
            .pop_front()
            .unwrap_or(DispatchOutcome::Delivered)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchCall {
    pub min_id: MessageId,
    pub limit: usize,
    pub offset_id: Option<MessageId>,
}

#[derive(Default)]
struct SourceState {
    script: VecDeque<Result<Vec<RelayMessage>, String>>,
    history: BTreeMap<MessageId, RelayMessage>,
    live: Vec<Result<RelayMessage, String>>,
    fetches: Vec<FetchCall>,
    connect_error: Option<String>,
    connects: usize,
    disconnects: usize,
    acks: Vec<MessageId>,
}

/// Scripted upstream. Queued pages are served first, in order; after that
/// fetches are answered from `history` the way a real chat would.
#[derive(Clone, Default)]
pub struct FakeSource {
    state: Arc<Mutex<SourceState>>,
}

impl FakeSource {
    pub fn scripted(pages: Vec<Vec<MessageId>>) -> Self {
        let source = Self::default();
        for page in pages {
            source.push_page(page);
        }
        source
    }

    pub fn with_history(ids: impl IntoIterator<Item = MessageId>) -> Self {
        let source = Self::default();
        source.add_history(ids);
        source
    }

    pub fn push_page(&self, ids: Vec<MessageId>) {
        let page = ids.into_iter().map(message).collect();
        self.state.lock().unwrap().script.push_back(Ok(page));
    }

    pub fn push_fetch_error(&self, error: &str) {
        self.state
            .lock()
            .unwrap()
            .script
            .push_back(Err(error.to_string()));
    }

    pub fn add_history(&self, ids: impl IntoIterator<Item = MessageId>) {
        let mut state = self.state.lock().unwrap();
        for id in ids {
            state.history.insert(id, message(id));
        }
    }

    pub fn set_live(&self, items: Vec<Result<RelayMessage, String>>) {
        self.state.lock().unwrap().live = items;
    }

    pub fn fail_connect(&self, error: &str) {
        self.state.lock().unwrap().connect_error = Some(error.to_string());
    }

    pub fn fetches(&self) -> Vec<FetchCall> {
        self.state.lock().unwrap().fetches.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }

    pub fn acks(&self) -> Vec<MessageId> {
        self.state.lock().unwrap().acks.clone()
    }
}

#[async_trait]
impl MessageSource for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    async fn connect(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        match &state.connect_error {
            Some(error) => Err(anyhow::anyhow!(error.clone())),
            None => Ok(()),
        }
    }

    async fn fetch_messages(
        &self,
        min_id: MessageId,
        limit: usize,
        offset_id: Option<MessageId>,
    ) -> Result<Vec<RelayMessage>> {
        let mut state = self.state.lock().unwrap();
        state.fetches.push(FetchCall {
            min_id,
            limit,
            offset_id,
        });
        if let Some(next) = state.script.pop_front() {
            return next.map_err(|e| anyhow::anyhow!(e));
        }
        Ok(state
            .history
            .values()
            .rev()
            .filter(|m| m.id > min_id && offset_id.map_or(true, |offset| m.id < offset))
            .take(limit)
            .cloned()
            .collect())
    }

    /// Yields the configured live items once, then stays open.
    fn subscribe(&self) -> BoxStream<'static, Result<RelayMessage>> {
        let items: Vec<_> = std::mem::take(&mut self.state.lock().unwrap().live);
        stream::iter(
            items
                .into_iter()
                .map(|item| item.map_err(|e| anyhow::anyhow!(e))),
        )
        .chain(stream::pending())
        .boxed()
    }

    async fn acknowledge(&self, cursor: MessageId) -> Result<()> {
        self.state.lock().unwrap().acks.push(cursor);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.lock().unwrap().disconnects += 1;
        Ok(())
    }
}

#[derive(Default)]
struct BotApiState {
    /// (update_id, chat_id, message_id), oldest first
    pending: VecDeque<(u64, i64, MessageId)>,
    next_update_id: u64,
    offsets: Vec<Option<i64>>,
}

/// Local stand-in for the Telegram Bot API. Answers `getMe` and `getUpdates`
/// and keeps a pending update queue with the same confirm-by-offset rule.
#[derive(Clone, Default)]
pub struct FakeBotApi {
    state: Arc<Mutex<BotApiState>>,
    url: String,
}

impl FakeBotApi {
    pub async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let api = Self {
            url: format!("http://{}", addr),
            ..Default::default()
        };
        let app = Router::new().fallback(handle_bot_api).with_state(api.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        api
    }

    pub fn bot(&self) -> Bot {
        Bot::new("42:TEST").set_api_url(reqwest::Url::parse(&self.url).unwrap())
    }

    /// Queue a text message from Ann Lee in `chat_id`.
    pub fn push_message(&self, chat_id: i64, message_id: MessageId) {
        let mut state = self.state.lock().unwrap();
        state.next_update_id += 1;
        let update_id = state.next_update_id;
        state.pending.push_back((update_id, chat_id, message_id));
    }

    /// Message ids Telegram would still deliver, in queue order.
    pub fn pending_message_ids(&self) -> Vec<MessageId> {
        let state = self.state.lock().unwrap();
        state.pending.iter().map(|&(_, _, id)| id).collect()
    }

    /// The `offset` of every getUpdates call so far.
    pub fn offsets(&self) -> Vec<Option<i64>> {
        self.state.lock().unwrap().offsets.clone()
    }

    fn get_updates(&self, params: &Value) -> Value {
        let offset = params["offset"].as_i64();
        let limit = params["limit"].as_u64().unwrap_or(100) as usize;
        let mut state = self.state.lock().unwrap();
        state.offsets.push(offset);
        if let Some(offset) = offset {
            state.pending.retain(|&(update_id, _, _)| update_id as i64 >= offset);
        }
        let updates: Vec<Value> = state
            .pending
            .iter()
            .take(limit)
            .map(|&(update_id, chat_id, message_id)| update_json(update_id, chat_id, message_id))
            .collect();
        Value::Array(updates)
    }
}

fn update_json(update_id: u64, chat_id: i64, message_id: MessageId) -> Value {
    json!({
        "update_id": update_id,
        "message": {
            "message_id": message_id,
            "date": 1_700_000_000 + message_id,
            "chat": { "id": chat_id, "type": "private", "first_name": "Ann" },
            "from": { "id": 7, "is_bot": false, "first_name": "Ann", "last_name": "Lee" },
            "text": format!("message {}", message_id),
        }
    })
}

async fn handle_bot_api(State(api): State<FakeBotApi>, uri: Uri, body: Bytes) -> Json<Value> {
    let method = uri.path().rsplit('/').next().unwrap_or_default().to_ascii_lowercase();
    let params: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let result = match method.as_str() {
        "getme" => json!({
            "id": 42,
            "is_bot": true,
            "first_name": "Relay",
            "username": "relay_bot",
            "can_join_groups": true,
            "can_read_all_group_messages": true,
            "supports_inline_queries": false,
            "can_connect_to_business": false,
            "has_main_web_app": false,
        }),
        "getupdates" => {
            let updates = api.get_updates(&params);
            let empty = updates.as_array().is_some_and(|u| u.is_empty());
            if empty && params["timeout"].as_u64().unwrap_or(0) > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            updates
        }
        other => {
            return Json(json!({
                "ok": false,
                "error_code": 404,
                "description": format!("Not Found: method {} is not faked", other),
            }))
        }
    };
    Json(json!({ "ok": true, "result": result }))
}
