use chrono::{DateTime, FixedOffset, TimeZone, Timelike, Utc};
use serde::Deserialize;

/// True iff the hour of `now` (in `now`'s own time zone) is in
/// `[start_hour, end_hour)`.
pub fn is_active<Tz: TimeZone>(now: &DateTime<Tz>, start_hour: u32, end_hour: u32) -> bool {
    let hour = now.hour();
    start_hour <= hour && hour < end_hour
}

/// Daily processing window in a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkHours {
    pub start_hour: u32,
    pub end_hour: u32,
    pub offset: FixedOffset,
}

impl WorkHours {
    pub fn new(start_hour: u32, end_hour: u32, offset: FixedOffset) -> Self {
        Self {
            start_hour,
            end_hour,
            offset,
        }
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        is_active(&now.with_timezone(&self.offset), self.start_hour, self.end_hour)
    }

    pub fn is_active_now(&self) -> bool {
        self.is_active_at(Utc::now())
    }

    /// Current local time in the window's offset, for log lines.
    pub fn local_now(&self) -> String {
        Utc::now()
            .with_timezone(&self.offset)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }
}

impl std::fmt::Display for WorkHours {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02}:00-{:02}:00 (UTC{})",
            self.start_hour, self.end_hour, self.offset
        )
    }
}

/// Where the work-hours window is enforced.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GatePolicy {
    /// Once per activation: a closed window skips the whole run.
    #[default]
    Activation,
    /// Per message: messages arriving outside the window are dropped.
    Message,
}

impl std::fmt::Display for GatePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatePolicy::Activation => write!(f, "activation"),
            GatePolicy::Message => write!(f, "message"),
        }
    }
}
