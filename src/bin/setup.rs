//! Interactive setup for tg-webhook-relay.
//!
//! Asks for the bot token, the chat to relay, the webhook URL and the
//! schedule, checks the token against the Bot API and writes `config.toml`.
//! Set `RELAY_ROOT` to write somewhere other than the current directory.

use anyhow::{bail, Context, Result};
use std::io::{self, Write};
use std::path::PathBuf;
use teloxide::prelude::*;

// ── Config formatting ──────────────────────────────────────────────────────────

struct ConfigParams<'a> {
    bot_token: &'a str,
    chat_id: i64,
    webhook_url: &'a str,
    mode: &'a str,
    work_start_hour: u32,
    work_end_hour: u32,
    timezone: &'a str,
}

/// Produces a valid config.toml string. Extracted so it can be unit-tested.
fn format_config(p: &ConfigParams<'_>) -> String {
    let bot_token = toml_string(p.bot_token);
    let chat_id = p.chat_id;
    let webhook_url = toml_string(p.webhook_url);
    let mode = toml_string(p.mode);
    let start = p.work_start_hour;
    let end = p.work_end_hour;
    let timezone = toml_string(p.timezone);

    format!(
        r#"[telegram]
bot_token = {bot_token}
chat_id = {chat_id}

[webhook]
url = {webhook_url}
send_interval_secs = 3.0
timeout_secs = 10
title = "Telegram relay"

[schedule]
mode = {mode}
cron = "0 */10 * * * *"
timezone = {timezone}
work_start_hour = {start}
work_end_hour = {end}
gate = "activation"

[cursor]
path = "last_id.txt"

[logging]
level = "info,tg_webhook_relay=debug"
# file = "logs/relay.log"
"#
    )
}

/// Quoted and escaped TOML string literal.
fn toml_string(raw: &str) -> String {
    toml::Value::String(raw.to_owned()).to_string()
}

fn parse_hour(raw: &str, default: u32, max: u32) -> Result<u32> {
    if raw.is_empty() {
        return Ok(default);
    }
    let hour: u32 = raw
        .parse()
        .with_context(|| format!("Not an hour: {raw}"))?;
    if hour > max {
        bail!("Hour must be between 0 and {max}, got {hour}");
    }
    Ok(hour)
}

fn parse_mode(raw: &str) -> Result<&'static str> {
    match raw.to_ascii_lowercase().as_str() {
        "" | "once" => Ok("once"),
        "listen" => Ok("listen"),
        "cron" => Ok("cron"),
        other => bail!("Unknown mode '{other}' (expected once, listen or cron)"),
    }
}

/// Ask the Bot API who the token belongs to.
async fn verify_token(token: &str) -> Result<String> {
    let me = Bot::new(token)
        .get_me()
        .await
        .context("Telegram rejected the bot token")?;
    Ok(match &me.username {
        Some(username) => format!("{} (@{})", me.first_name, username),
        None => me.first_name.clone(),
    })
}

// ── Entry point ────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let project_root =
        PathBuf::from(std::env::var("RELAY_ROOT").unwrap_or_else(|_| ".".to_string()));

    println!("=== tg-webhook-relay setup ===\n");

    let read_line = |prompt: &str| -> Result<String> {
        print!("{prompt}");
        io::stdout().flush()?;
        let mut buf = String::new();
        io::stdin().read_line(&mut buf)?;
        Ok(buf.trim().to_owned())
    };

    let or_default = |s: String, default: &str| {
        if s.is_empty() {
            default.to_owned()
        } else {
            s
        }
    };

    let bot_token = read_line("Telegram bot token: ")?;
    if bot_token.is_empty() {
        bail!("A bot token is required");
    }
    print!("Checking token... ");
    io::stdout().flush()?;
    let bot_name = verify_token(&bot_token).await?;
    println!("ok, this is {bot_name}");

    let chat_id: i64 = read_line("Chat id to relay (e.g. -1001234567890): ")?
        .parse()
        .context("Chat id must be an integer")?;
    let webhook_url = read_line("Webhook URL (DingTalk, Feishu, WeCom or generic): ")?;
    if !(webhook_url.starts_with("http://") || webhook_url.starts_with("https://")) {
        bail!("Webhook URL must start with http:// or https://");
    }
    let mode = parse_mode(&read_line("Mode (once/listen/cron) [once]: ")?)?;
    let work_start_hour = parse_hour(&read_line("Work start hour [0]: ")?, 0, 23)?;
    let work_end_hour = parse_hour(&read_line("Work end hour [24]: ")?, 24, 24)?;
    if work_start_hour >= work_end_hour {
        bail!("Work start hour must be before work end hour");
    }
    let timezone = or_default(read_line("UTC offset [+08:00]: ")?, "+08:00");

    let config = format_config(&ConfigParams {
        bot_token: &bot_token,
        chat_id,
        webhook_url: &webhook_url,
        mode,
        work_start_hour,
        work_end_hour,
        timezone: &timezone,
    });

    let config_path = project_root.join("config.toml");
    std::fs::write(&config_path, &config)
        .with_context(|| format!("Could not write {}", config_path.display()))?;

    println!("\n✓  config.toml saved to {}", config_path.display());
    println!("   Run the relay with:  cargo run --bin tg-webhook-relay");
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────────────────
