use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::pipeline::Pipeline;
use crate::platform::MessageSource;
use crate::reconciler::Reconciler;

/// Wait after a failed poll before asking the source again
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Feeds live messages through the pipeline until shutdown is requested.
pub struct Listener<'a> {
    source: &'a dyn MessageSource,
    shutdown: watch::Receiver<bool>,
    retry_delay: Duration,
    behind: bool,
}

/// Counts for the lifetime of one listener run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenReport {
    pub received: usize,
    pub failed: usize,
    pub catch_ups: usize,
}

impl<'a> Listener<'a> {
    pub fn new(source: &'a dyn MessageSource, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            source,
            shutdown,
            retry_delay: RETRY_DELAY,
            behind: false,
        }
    }

    /// Start as if a delivery had already failed: the first live message
    /// triggers a catch-up pass.
    pub fn behind(mut self, behind: bool) -> Self {
        self.behind = behind;
        self
    }

    #[cfg(test)]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `delay` unless shutdown arrives first. Returns false on shutdown.
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Run until shutdown. Failures never end the loop: a failed delivery
    /// leaves the cursor behind and triggers a catch-up pass before the next
    /// live message; a failed poll is retried after a pause.
    pub async fn run(&mut self, pipeline: &mut Pipeline) -> Result<ListenReport> {
        let mut report = ListenReport::default();
        let mut stream = self.source.subscribe();
        let mut behind = self.behind;

        info!("Listening for new messages from {}", self.source.name());

        loop {
            if self.shutdown_requested() {
                break;
            }

            let next = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                next = stream.next() => next,
            };

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!(stage = "subscribe", "Polling for new messages failed: {:#}", e);
                    if !self.pause(self.retry_delay).await {
                        break;
                    }
                    continue;
                }
                None => {
                    warn!(stage = "subscribe", "Subscription ended, resubscribing");
                    if !self.pause(self.retry_delay).await {
                        break;
                    }
                    stream = self.source.subscribe();
                    continue;
                }
            };
            report.received += 1;

            if behind {
                info!("Catching up from message {} before live delivery", pipeline.cursor());
                report.catch_ups += 1;
                match Reconciler::new(self.source).run(pipeline).await {
                    Ok(catch_up) => {
                        info!(
                            "Catch-up relayed {} message(s), cursor at {}",
                            catch_up.delivered + catch_up.rejected,
                            catch_up.cursor
                        );
                        behind = false;
                    }
                    Err(e) => warn!("Catch-up pass failed, will retry: {:#}", e),
                }
            }

            if let Err(e) = pipeline.process(&message).await {
                error!(message_id = message.id, "Live delivery failed: {:#}", e);
                report.failed += 1;
                behind = true;
            }
            if let Err(e) = self.source.acknowledge(pipeline.cursor()).await {
                warn!("Failed to acknowledge cursor {}: {:#}", pipeline.cursor(), e);
            }
        }

        info!(
            "Listener stopped: {} received, {} failed",
            report.received, report.failed
        );
        Ok(report)
    }
}
