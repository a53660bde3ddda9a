mod config;
mod cursor;
mod gate;
mod listener;
mod pipeline;
mod platform;
mod reconciler;
mod relay;
mod scheduler;
mod webhook;

#[cfg(test)]
mod testing;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use crate::config::{Config, LoggingConfig, Mode};
use crate::cursor::{Cursor, FileCursorStore};
use crate::pipeline::Pipeline;
use crate::platform::telegram::TelegramSource;
use crate::relay::{run_scheduled, Relay};
use crate::webhook::{Dispatcher, Formatter, TargetKind, WebhookSink};

#[derive(Debug, PartialEq)]
struct Args {
    config_path: PathBuf,
    mode: Option<Mode>,
}

fn parse_args<I>(args: I) -> Result<Args>
where
    I: IntoIterator<Item = String>,
{
    let mut config_path = None;
    let mut mode = None;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        if arg == "--mode" {
            let value = args.next().context("--mode needs a value")?;
            mode = Some(value.parse()?);
        } else if let Some(value) = arg.strip_prefix("--mode=") {
            mode = Some(value.parse()?);
        } else if arg.starts_with("--") {
            bail!("Unknown option: {}", arg);
        } else if config_path.is_none() {
            config_path = Some(PathBuf::from(arg));
        } else {
            bail!("Unexpected argument: {}", arg);
        }
    }

    Ok(Args {
        config_path: config_path.unwrap_or_else(|| PathBuf::from("config.toml")),
        mode,
    })
}

/// Stdout always, plus an append-only file when `[logging] file` is set. The
/// returned guard flushes the file writer on drop and must live until exit.
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&logging.level))
        .with_context(|| format!("Invalid log level: {}", logging.level))?;

    let (file_layer, guard) = match &logging.file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}

/// Non-blocking appender for `path`, creating its directory first.
fn file_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    let file_name = path
        .file_name()
        .with_context(|| format!("Log file has no file name: {}", path.display()))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args(std::env::args().skip(1))?;

    let mut config = Config::load(&args.config_path)
        .with_context(|| format!("Failed to load config from {}", args.config_path.display()))?;
    if let Some(mode) = args.mode {
        config.schedule.mode = mode;
    }

    let _log_guard = init_logging(&config.logging)?;
    info!("Configuration loaded from: {}", args.config_path.display());
    config.validate().context("Invalid configuration")?;
    for line in config.summary() {
        info!("{}", line);
    }

    let offset = config.offset()?;
    let hours = config.work_hours()?;

    let kind = TargetKind::classify(&config.webhook.url);
    info!("Webhook target: {}", kind);
    let formatter = Formatter::new(kind, config.webhook.title.clone(), offset);
    let sink = WebhookSink::new(&config.webhook.url, kind, config.timeout())?;
    let dispatcher = Dispatcher::new(Box::new(sink), config.send_interval());
    let cursor = Cursor::open(Box::new(FileCursorStore::new(config.cursor.path.clone()))).await;
    let pipeline = Pipeline::new(formatter, dispatcher, cursor);

    let source = TelegramSource::new(&config.telegram.bot_token, config.telegram.chat_id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut relay = Relay::new(
        Box::new(source),
        pipeline,
        hours,
        config.schedule.gate,
        shutdown_rx,
    );

    let mode = config.schedule.mode;
    if mode != Mode::Once {
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutting down...");
            let _ = shutdown_tx.send(true);
        });
    }

    match mode {
        Mode::Once => relay.run_once().await?,
        Mode::Listen => relay.listen().await?,
        Mode::Cron => run_scheduled(relay, &config.schedule.cron, offset).await?,
    }

    info!("Relay stopped");
    Ok(())
}
