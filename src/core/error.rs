//! 守护进程错误类型
//!
//! 只有启动期错误（配置、队列缺失、后端缺失）会让进程以非零码退出；
//! 稳态错误（后端失败、同步冲突、Worker 崩溃）在各自循环里记录日志后吸收。

use std::path::PathBuf;

use thiserror::Error;

use crate::provider::ProviderError;
use crate::queue::QueueError;

#[derive(Error, Debug)]
pub enum KeeperError {
    #[error("Config error: {0}")]
    Config(String),

    /// 队列根目录或 missions 文件不存在（未初始化）
    #[error("Durable queue not initialized at {0}")]
    QueueMissing(PathBuf),

    #[error("Backend binary not found in PATH: {0}")]
    BackendMissing(String),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for KeeperError {
    fn from(e: config::ConfigError) -> Self {
        KeeperError::Config(e.to_string())
    }
}
