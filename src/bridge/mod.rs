//! 汇报 Worker：与操作者之间的消息桥

pub mod notifier;
pub mod reporting;

pub use notifier::{notifier_from_config, CommandNotifier, LogNotifier, Notifier};
pub use reporting::{PollReport, ReportingLoop};
