use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::FixedOffset;
use serde::Deserialize;

use crate::gate::{GatePolicy, WorkHours};

/// Upper bound for `webhook.send_interval_secs`
const MAX_SEND_INTERVAL_SECS: f64 = 3600.0;
/// Upper bound for `webhook.timeout_secs`
const MAX_TIMEOUT_SECS: u64 = 300;

/// How the relay is activated.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One reconciliation pass, then exit. Meant for an external scheduler.
    #[default]
    Once,
    /// Reconcile, then follow new messages until signaled.
    Listen,
    /// In-process cron schedule of reconciliation passes.
    Cron,
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(Mode::Once),
            "listen" => Ok(Mode::Listen),
            "cron" => Ok(Mode::Cron),
            other => bail!("Unknown mode '{}' (expected once, listen or cron)", other),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Once => write!(f, "once"),
            Mode::Listen => write!(f, "listen"),
            Mode::Cron => write!(f, "cron"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub cursor: CursorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_send_interval")]
    pub send_interval_secs: f64,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_title")]
    pub title: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub work_start_hour: u32,
    #[serde(default = "default_work_end_hour")]
    pub work_end_hour: u32,
    #[serde(default)]
    pub gate: GatePolicy,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CursorConfig {
    #[serde(default = "default_cursor_path")]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Also write plain-text logs here when set
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_send_interval() -> f64 {
    3.0
}

fn default_timeout() -> u64 {
    10
}

fn default_title() -> String {
    "Telegram relay".to_string()
}

fn default_cron() -> String {
    "0 */10 * * * *".to_string()
}

fn default_timezone() -> String {
    "+08:00".to_string()
}

fn default_work_end_hour() -> u32 {
    24
}

fn default_cursor_path() -> PathBuf {
    PathBuf::from("last_id.txt")
}

fn default_log_level() -> String {
    "info,tg_webhook_relay=debug".to_string()
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            send_interval_secs: default_send_interval(),
            timeout_secs: default_timeout(),
            title: default_title(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            cron: default_cron(),
            timezone: default_timezone(),
            work_start_hour: 0,
            work_end_hour: default_work_end_hour(),
            gate: GatePolicy::default(),
        }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            path: default_cursor_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// Parse a fixed UTC offset: `UTC`, `Z`, `+8`, `+08`, `+08:00`, `-05:30`.
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let s = raw.trim();
    let s = s
        .strip_prefix("UTC")
        .or_else(|| s.strip_prefix("utc"))
        .unwrap_or(s);
    if s.is_empty() || s == "Z" || s == "z" {
        return FixedOffset::east_opt(0).context("zero offset");
    }

    let (sign, rest) = match s.as_bytes()[0] {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => bail!("Invalid timezone '{}': expected an offset like +08:00", raw),
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours
        .parse()
        .with_context(|| format!("Invalid timezone '{}': bad hours", raw))?;
    let minutes: i32 = minutes
        .parse()
        .with_context(|| format!("Invalid timezone '{}': bad minutes", raw))?;
    if hours > 14 || minutes > 59 {
        bail!("Invalid timezone '{}': offset out of range", raw);
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .with_context(|| format!("Invalid timezone '{}'", raw))
}

/// Show only the tail of a secret.
fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

fn shorten(url: &str, max_chars: usize) -> String {
    if url.chars().count() <= max_chars {
        return url.to_string();
    }
    let head: String = url.chars().take(max_chars).collect();
    format!("{}...", head)
}

impl Config {
    /// Read `path`, falling back to defaults when the file does not exist.
    /// Environment overrides are applied on top; nothing is validated here.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `RELAY_*` overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("RELAY_BOT_TOKEN") {
            self.telegram.bot_token = token;
        }
        if let Some(chat_id) = lookup("RELAY_CHAT_ID") {
            self.telegram.chat_id = chat_id
                .trim()
                .parse()
                .with_context(|| format!("RELAY_CHAT_ID is not an integer: {}", chat_id))?;
        }
        if let Some(url) = lookup("RELAY_WEBHOOK_URL") {
            self.webhook.url = url;
        }
        if let Some(mode) = lookup("RELAY_MODE") {
            self.schedule.mode = mode.parse().context("Invalid RELAY_MODE")?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            bail!("telegram.bot_token is required (or set RELAY_BOT_TOKEN)");
        }
        if self.telegram.chat_id == 0 {
            bail!("telegram.chat_id is required (or set RELAY_CHAT_ID)");
        }

        let url = self.webhook.url.trim();
        if url.is_empty() {
            bail!("webhook.url is required (or set RELAY_WEBHOOK_URL)");
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("webhook.url must be an http(s) URL, got '{}'", url);
        }
        let interval = self.webhook.send_interval_secs;
        if !(0.0..=MAX_SEND_INTERVAL_SECS).contains(&interval) {
            bail!(
                "webhook.send_interval_secs must be between 0 and {}, got {}",
                MAX_SEND_INTERVAL_SECS,
                interval
            );
        }
        let timeout = self.webhook.timeout_secs;
        if timeout == 0 || timeout > MAX_TIMEOUT_SECS {
            bail!(
                "webhook.timeout_secs must be between 1 and {}, got {}",
                MAX_TIMEOUT_SECS,
                timeout
            );
        }

        let schedule = &self.schedule;
        if schedule.work_start_hour > 23 {
            bail!(
                "schedule.work_start_hour must be 0-23, got {}",
                schedule.work_start_hour
            );
        }
        if schedule.work_end_hour > 24 {
            bail!(
                "schedule.work_end_hour must be 0-24, got {}",
                schedule.work_end_hour
            );
        }
        if schedule.work_start_hour >= schedule.work_end_hour {
            bail!(
                "schedule.work_start_hour ({}) must be before work_end_hour ({})",
                schedule.work_start_hour,
                schedule.work_end_hour
            );
        }
        parse_utc_offset(&schedule.timezone)?;
        Ok(())
    }

    /// Out-of-range values saturate; `validate` rejects them first.
    pub fn send_interval(&self) -> Duration {
        let secs = self.webhook.send_interval_secs;
        Duration::try_from_secs_f64(secs.clamp(0.0, MAX_SEND_INTERVAL_SECS))
            .unwrap_or(Duration::ZERO)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.webhook.timeout_secs)
    }

    pub fn offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.schedule.timezone)
    }

    pub fn work_hours(&self) -> Result<WorkHours> {
        Ok(WorkHours::new(
            self.schedule.work_start_hour,
            self.schedule.work_end_hour,
            self.offset()?,
        ))
    }

    /// Startup summary with secrets masked.
    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec![
            format!("  Mode: {}", self.schedule.mode),
            format!("  Bot token: {}", mask(&self.telegram.bot_token)),
            format!("  Chat: {}", self.telegram.chat_id),
            format!("  Webhook: {}", shorten(&self.webhook.url, 50)),
            format!("  Send interval: {}s", self.webhook.send_interval_secs),
            format!(
                "  Work hours: {:02}:00-{:02}:00 ({}), gate: {}",
                self.schedule.work_start_hour,
                self.schedule.work_end_hour,
                self.schedule.timezone,
                self.schedule.gate
            ),
            format!("  Cursor file: {}", self.cursor.path.display()),
        ];
        if self.schedule.mode == Mode::Cron {
            lines.push(format!("  Cron: {}", self.schedule.cron));
        }
        lines
    }
}
