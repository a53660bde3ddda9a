use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::pipeline::{Pipeline, Processed};
use crate::platform::{MessageId, MessageSource, RelayMessage};

/// Messages requested per history page
pub const PAGE_SIZE: usize = 100;
/// Pause between history pages to stay under upstream rate limits
pub const PAGE_DELAY: Duration = Duration::from_millis(500);

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Messages returned by the source, duplicates included
    pub fetched: usize,
    /// Messages newer than the cursor, after dedup
    pub pending: usize,
    pub delivered: usize,
    pub rejected: usize,
    /// Dropped by the gate or already behind the cursor
    pub skipped: usize,
    pub cursor: MessageId,
}

/// Catches the pipeline up with everything the source has after the cursor.
pub struct Reconciler<'a> {
    source: &'a dyn MessageSource,
    page_size: usize,
    page_delay: Duration,
}

impl<'a> Reconciler<'a> {
    pub fn new(source: &'a dyn MessageSource) -> Self {
        Self {
            source,
            page_size: PAGE_SIZE,
            page_delay: PAGE_DELAY,
        }
    }

    #[cfg(test)]
    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    /// Page backwards from the newest message until the cursor is crossed or
    /// the source runs dry. Returns every message fetched, in arrival order.
    async fn fetch_since(&self, cursor: MessageId) -> Result<Vec<RelayMessage>> {
        let mut collected = Vec::new();
        let mut offset: Option<MessageId> = None;
        let mut page_number = 0;

        loop {
            page_number += 1;
            debug!(
                "Fetching history page {} (after {}, before {:?})",
                page_number, cursor, offset
            );
            let page = self
                .source
                .fetch_messages(cursor, self.page_size, offset)
                .await
                .with_context(|| {
                    format!(
                        "Failed to fetch history page {} from {}",
                        page_number,
                        self.source.name()
                    )
                })?;

            let Some(page_min) = page.iter().map(|m| m.id).min() else {
                break;
            };
            let page_len = page.len();
            collected.extend(page);

            if page_min <= cursor {
                break;
            }
            offset = Some(offset.map_or(page_min, |o| o.min(page_min)));
            if page_len < self.page_size {
                break;
            }
            tokio::time::sleep(self.page_delay).await;
        }

        Ok(collected)
    }

    /// Fetched messages newer than `cursor`, oldest first, each id once.
    pub async fn collect(&self, cursor: MessageId) -> Result<(usize, Vec<RelayMessage>)> {
        let fetched = self.fetch_since(cursor).await?;
        let total = fetched.len();

        let mut pending: Vec<RelayMessage> =
            fetched.into_iter().filter(|m| m.id > cursor).collect();
        pending.sort_by_key(|m| m.id);
        pending.dedup_by_key(|m| m.id);
        Ok((total, pending))
    }

    /// One full pass: collect, then push every pending message through the
    /// pipeline in id order. Stops at the first transport failure; whatever
    /// was processed before it stays committed.
    pub async fn run(&self, pipeline: &mut Pipeline) -> Result<ReconcileReport> {
        let start_cursor = pipeline.cursor();
        info!("Checking for messages after {}", start_cursor);
        self.source
            .acknowledge(start_cursor)
            .await
            .with_context(|| format!("Failed to acknowledge cursor {}", start_cursor))?;

        let (fetched, pending) = self.collect(start_cursor).await?;
        let mut report = ReconcileReport {
            fetched,
            pending: pending.len(),
            cursor: start_cursor,
            ..Default::default()
        };

        if pending.is_empty() {
            info!("No new messages");
            return Ok(report);
        }
        info!("Found {} new message(s), relaying in order", pending.len());

        for (index, message) in pending.iter().enumerate() {
            debug!("[{}/{}] message {}", index + 1, pending.len(), message.id);
            let processed = pipeline.process(message).await.with_context(|| {
                format!(
                    "Reconciliation stopped at message {} ({} of {} relayed)",
                    message.id,
                    report.delivered + report.rejected,
                    pending.len()
                )
            })?;
            match processed {
                Processed::Delivered => report.delivered += 1,
                Processed::Rejected => report.rejected += 1,
                Processed::OutsideHours | Processed::AlreadySeen => report.skipped += 1,
            }
            report.cursor = pipeline.cursor();
        }

        Ok(report)
    }
}
