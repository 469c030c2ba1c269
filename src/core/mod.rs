//! 核心：错误分类与关闭 / 取消上下文

pub mod error;
pub mod shutdown;

pub use error::KeeperError;
pub use shutdown::{ShutdownManager, ShutdownReason};
