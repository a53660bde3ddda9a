use chrono::FixedOffset;
use serde_json::{json, Value};

use crate::platform::RelayMessage;

/// Body used when a message carries no text (stickers, photos, ...).
pub const NON_TEXT_PLACEHOLDER: &str = "[non-text message]";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Payload family a webhook URL expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    DingTalk,
    Feishu,
    WeCom,
    /// Unrecognized endpoint. Uses the DingTalk markdown shape, which is the
    /// plainest of the three.
    Generic,
}

impl TargetKind {
    pub fn classify(url: &str) -> Self {
        let url = url.to_lowercase();
        if url.contains("dingtalk.com") {
            TargetKind::DingTalk
        } else if url.contains("feishu.cn") || url.contains("larksuite.com") {
            TargetKind::Feishu
        } else if url.contains("weixin.qq.com") {
            TargetKind::WeCom
        } else {
            TargetKind::Generic
        }
    }
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::DingTalk => write!(f, "dingtalk"),
            TargetKind::Feishu => write!(f, "feishu"),
            TargetKind::WeCom => write!(f, "wecom"),
            TargetKind::Generic => write!(f, "generic"),
        }
    }
}

/// Builds webhook payloads for one target kind.
#[derive(Debug, Clone)]
pub struct Formatter {
    kind: TargetKind,
    title: String,
    offset: FixedOffset,
}

/// The four fields every payload shape carries, already rendered.
struct Fields {
    sender: String,
    time: String,
    id: String,
    body: String,
}

impl Fields {
    fn of(message: &RelayMessage, offset: &FixedOffset) -> Self {
        Self {
            sender: message.sender.display_name(),
            time: message
                .date
                .with_timezone(offset)
                .format(TIME_FORMAT)
                .to_string(),
            id: message.id.to_string(),
            body: message
                .text
                .as_deref()
                .filter(|t| !t.is_empty())
                .unwrap_or(NON_TEXT_PLACEHOLDER)
                .to_string(),
        }
    }
}

impl Formatter {
    pub fn new(kind: TargetKind, title: impl Into<String>, offset: FixedOffset) -> Self {
        Self {
            kind,
            title: title.into(),
            offset,
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn format(&self, message: &RelayMessage) -> Value {
        let fields = Fields::of(message, &self.offset);
        match self.kind {
            TargetKind::DingTalk | TargetKind::Generic => self.dingtalk(&fields),
            TargetKind::Feishu => self.feishu(&fields),
            TargetKind::WeCom => self.wecom(&fields),
        }
    }

    fn dingtalk(&self, f: &Fields) -> Value {
        json!({
            "msgtype": "markdown",
            "markdown": {
                "title": self.title,
                "text": format!(
                    "### {}\n\n**Sender:** {}\n\n**Time:** {}\n\n**Message ID:** {}\n\n**Content:**\n\n{}",
                    self.title, f.sender, f.time, f.id, f.body
                ),
            }
        })
    }

    fn feishu(&self, f: &Fields) -> Value {
        let line = |text: String| json!([{ "tag": "text", "text": text }]);
        json!({
            "msg_type": "post",
            "content": {
                "post": {
                    "zh_CN": {
                        "title": self.title,
                        "content": [
                            line(format!("[Sender] {}\n", f.sender)),
                            line(format!("[Time] {}\n", f.time)),
                            line(format!("[Message ID] {}\n", f.id)),
                            line(format!("[Content]\n{}", f.body)),
                        ]
                    }
                }
            }
        })
    }

    fn wecom(&self, f: &Fields) -> Value {
        json!({
            "msgtype": "markdown",
            "markdown": {
                "content": format!(
                    "### {}\n**Sender:** {}\n**Time:** {}\n**Message ID:** {}\n**Content:**\n{}",
                    self.title, f.sender, f.time, f.id, f.body
                ),
            }
        })
    }
}
