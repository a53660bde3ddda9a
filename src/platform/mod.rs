pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

/// Upstream message identifier. Monotonic within one chat.
pub type MessageId = i64;

/// Who posted a message, resolved once when the message enters the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sender {
    Person {
        first_name: String,
        last_name: Option<String>,
    },
    /// A channel, or a group posting anonymously on behalf of itself.
    Channel { title: String },
    Unknown,
}

impl Sender {
    pub fn display_name(&self) -> String {
        match self {
            Sender::Person {
                first_name,
                last_name,
            } => {
                let first = first_name.trim();
                match last_name.as_deref().map(str::trim) {
                    Some(last) if !last.is_empty() && !first.is_empty() => {
                        format!("{} {}", first, last)
                    }
                    Some(last) if !last.is_empty() => last.to_string(),
                    _ if !first.is_empty() => first.to_string(),
                    _ => "unknown".to_string(),
                }
            }
            Sender::Channel { title } if !title.trim().is_empty() => title.trim().to_string(),
            _ => "unknown".to_string(),
        }
    }
}

/// A chat message as seen by the relay. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayMessage {
    pub id: MessageId,
    pub date: DateTime<Utc>,
    pub sender: Sender,
    /// `None` for stickers, photos without captions and other non-text content.
    pub text: Option<String>,
}

/// A single upstream chat the relay reads from.
///
/// Pages returned by `fetch_messages` are ordered newest first and only
/// contain ids in `(min_id, offset_id)`; `offset_id = None` means "up to the
/// most recent message".
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Short name for logs (e.g. "telegram").
    fn name(&self) -> &str;

    /// Authenticate and verify the connection. Called once per activation.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn fetch_messages(
        &self,
        min_id: MessageId,
        limit: usize,
        offset_id: Option<MessageId>,
    ) -> Result<Vec<RelayMessage>>;

    /// Stream of newly observed messages in receipt order. Transient poll
    /// failures are yielded as `Err` items; the stream keeps going after them.
    fn subscribe(&self) -> BoxStream<'static, Result<RelayMessage>>;

    /// Every message at or below `cursor` has been handled. Sources that
    /// keep an upstream delivery queue may release it up to there, and never
    /// further.
    async fn acknowledge(&self, _cursor: MessageId) -> Result<()> {
        Ok(())
    }

    /// Release the connection. Must not give up anything above the last
    /// acknowledged cursor.
    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

/// Shorten a message body for log lines without splitting a UTF-8 character.
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}
