use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::cursor::Cursor;
use crate::gate::WorkHours;
use crate::platform::{preview, MessageId, RelayMessage};
use crate::webhook::{DispatchOutcome, Dispatcher, Formatter};

/// What happened to one message that went through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    Delivered,
    /// The sink refused it. The cursor still moves past it.
    Rejected,
    /// Dropped by the per-message work-hours gate.
    OutsideHours,
    /// At or below the cursor; already handled earlier.
    AlreadySeen,
}

/// The single per-message path shared by history reconciliation and the live
/// listener: gate → format → dispatch → advance cursor.
pub struct Pipeline {
    formatter: Formatter,
    dispatcher: Dispatcher,
    cursor: Cursor,
    message_gate: Option<WorkHours>,
}

impl Pipeline {
    pub fn new(formatter: Formatter, dispatcher: Dispatcher, cursor: Cursor) -> Self {
        Self {
            formatter,
            dispatcher,
            cursor,
            message_gate: None,
        }
    }

    /// Check `hours` before every message instead of once per activation.
    pub fn with_message_gate(mut self, hours: WorkHours) -> Self {
        self.set_message_gate(hours);
        self
    }

    pub fn set_message_gate(&mut self, hours: WorkHours) {
        self.message_gate = Some(hours);
    }

    pub fn cursor(&self) -> MessageId {
        self.cursor.value()
    }

    pub fn send_interval(&self) -> Duration {
        self.dispatcher.interval()
    }

    /// Run one message through the pipeline.
    ///
    /// A transport failure is returned as an error and leaves the cursor
    /// where it was, so the message is retried by the next reconciliation.
    pub async fn process(&mut self, message: &RelayMessage) -> Result<Processed> {
        if message.id <= self.cursor.value() {
            debug!(
                "Skipping message {} (cursor at {})",
                message.id,
                self.cursor.value()
            );
            return Ok(Processed::AlreadySeen);
        }

        if let Some(hours) = &self.message_gate {
            if !hours.is_active_at(Utc::now()) {
                debug!(
                    "Dropping message {} outside work hours {}",
                    message.id, hours
                );
                self.cursor.advance(message.id).await;
                return Ok(Processed::OutsideHours);
            }
        }

        let sender = message.sender.display_name();
        info!(
            "Relaying message {} from {}: {}",
            message.id,
            sender,
            preview(message.text.as_deref().unwrap_or("-"), 100)
        );

        let payload = self.formatter.format(message);
        match self.dispatcher.send(&payload).await {
            DispatchOutcome::Delivered => {
                info!(
                    "Message {} delivered to {} webhook",
                    message.id,
                    self.formatter.kind()
                );
                self.cursor.advance(message.id).await;
                Ok(Processed::Delivered)
            }
            DispatchOutcome::Rejected(reason) => {
                warn!(
                    message_id = message.id,
                    stage = "dispatch",
                    "Webhook rejected message, moving on: {}",
                    reason
                );
                self.cursor.advance(message.id).await;
                Ok(Processed::Rejected)
            }
            DispatchOutcome::TransportFailed(reason) => {
                error!(
                    message_id = message.id,
                    stage = "dispatch",
                    "Webhook unreachable: {}",
                    reason
                );
                anyhow::bail!(
                    "webhook transport failed for message {}: {}",
                    message.id,
                    reason
                )
            }
        }
    }
}
