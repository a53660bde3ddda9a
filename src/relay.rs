use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::FixedOffset;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::gate::{GatePolicy, WorkHours};
use crate::listener::Listener;
use crate::pipeline::Pipeline;
use crate::platform::MessageSource;
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::scheduler::Scheduler;

/// Owns the upstream connection, the pipeline (and with it the cursor) and
/// the shutdown signal. One instance per process.
pub struct Relay {
    source: Box<dyn MessageSource>,
    pipeline: Pipeline,
    hours: WorkHours,
    gate: GatePolicy,
    shutdown: watch::Receiver<bool>,
}

impl Relay {
    pub fn new(
        source: Box<dyn MessageSource>,
        pipeline: Pipeline,
        hours: WorkHours,
        gate: GatePolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let pipeline = match gate {
            GatePolicy::Activation => pipeline,
            GatePolicy::Message => pipeline.with_message_gate(hours),
        };
        Self {
            source,
            pipeline,
            hours,
            gate,
            shutdown,
        }
    }

    /// False when the activation gate is closed; the caller skips the run.
    fn activation_allowed(&self) -> bool {
        if self.gate == GatePolicy::Message || self.hours.is_active_now() {
            return true;
        }
        info!(
            "Outside work hours {} (local time {}), skipping",
            self.hours,
            self.hours.local_now()
        );
        false
    }

    async fn connect(&self) -> Result<()> {
        self.source
            .connect()
            .await
            .with_context(|| format!("Failed to connect to {}", self.source.name()))
    }

    async fn disconnect(&self) {
        if let Err(e) = self.source.acknowledge(self.pipeline.cursor()).await {
            warn!("Failed to acknowledge cursor {}: {:#}", self.pipeline.cursor(), e);
        }
        match self.source.disconnect().await {
            Ok(()) => info!("Disconnected from {}", self.source.name()),
            Err(e) => warn!("Disconnect from {} failed: {:#}", self.source.name(), e),
        }
    }

    /// Reconcile until a pass finds nothing new. A source may hold back part
    /// of its backlog until earlier messages are acknowledged, so one pass is
    /// not always enough. Errors are logged, never returned: partial progress
    /// is already on disk and the next pass resumes from it.
    async fn reconcile(&mut self) -> bool {
        loop {
            let before = self.pipeline.cursor();
            let result = Reconciler::new(self.source.as_ref())
                .run(&mut self.pipeline)
                .await;
            match result {
                Ok(report) => {
                    log_report(&report, &self.pipeline);
                    if report.pending == 0 || report.cursor == before {
                        return true;
                    }
                }
                Err(e) => {
                    error!(
                        stage = "reconcile",
                        cursor = self.pipeline.cursor(),
                        "Reconciliation pass failed: {:#}",
                        e
                    );
                    return false;
                }
            }
        }
    }

    /// Fixed-interval activation: one pass, then return.
    pub async fn run_once(&mut self) -> Result<()> {
        if !self.activation_allowed() {
            return Ok(());
        }
        self.connect().await?;
        self.reconcile().await;
        self.disconnect().await;
        Ok(())
    }

    /// Long-running activation: catch up, then follow new messages until
    /// the shutdown signal fires.
    pub async fn listen(&mut self) -> Result<()> {
        if !self.activation_allowed() {
            return Ok(());
        }
        self.connect().await?;
        self.follow().await?;
        self.disconnect().await;
        Ok(())
    }

    /// Catch-up pass, then the live loop. A session can outlast the work
    /// hours it started in, so live messages always go through the gate.
    async fn follow(&mut self) -> Result<()> {
        let caught_up = self.reconcile().await;
        self.pipeline.set_message_gate(self.hours);

        let report = Listener::new(self.source.as_ref(), self.shutdown.clone())
            .behind(!caught_up)
            .run(&mut self.pipeline)
            .await?;
        info!(
            "Live session ended: {} received, {} failed, {} catch-up pass(es), cursor at {}",
            report.received,
            report.failed,
            report.catch_ups,
            self.pipeline.cursor()
        );
        Ok(())
    }

    async fn scheduled_pass(&mut self) {
        if self.activation_allowed() {
            self.reconcile().await;
        }
    }
}

fn log_report(report: &ReconcileReport, pipeline: &Pipeline) {
    let sends = (report.delivered + report.rejected) as u32;
    info!(
        "Pass complete: {} fetched, {} new, {} delivered, {} rejected, {} skipped, cursor at {} (~{:?} pacing)",
        report.fetched,
        report.pending,
        report.delivered,
        report.rejected,
        report.skipped,
        report.cursor,
        pipeline.send_interval() * sends.saturating_sub(1)
    );
}

/// Cron activation: run a gated pass on every tick of `cron_expr` until the
/// shutdown signal fires. A tick that lands while the previous pass is still
/// running is skipped.
pub async fn run_scheduled(relay: Relay, cron_expr: &str, offset: FixedOffset) -> Result<()> {
    let mut shutdown = relay.shutdown.clone();
    relay.connect().await?;
    let relay = Arc::new(Mutex::new(relay));

    let mut scheduler = Scheduler::new().await?;
    let job_relay = relay.clone();
    scheduler
        .add_cron_job(cron_expr, offset, "relay-pass", move || {
            let relay = job_relay.clone();
            Box::pin(async move {
                let Ok(mut relay) = relay.try_lock() else {
                    warn!("Previous pass still running, skipping this tick");
                    return;
                };
                relay.scheduled_pass().await;
            })
        })
        .await?;
    scheduler.start().await?;

    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
    info!("Shutdown requested, stopping scheduler");

    scheduler.shutdown().await?;
    // waits for an in-flight pass to finish
    relay.lock().await.disconnect().await;
    Ok(())
}
