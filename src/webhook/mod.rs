pub mod dispatch;
pub mod format;

pub use dispatch::{DispatchOutcome, Dispatcher, Sink, WebhookSink};
pub use format::{Formatter, TargetKind};
