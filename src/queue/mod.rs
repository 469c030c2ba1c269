//! 持久任务队列：版本化目录中的 missions.md 看板、审计记录与收发件箱
//!
//! 目录布局（队列根目录）：
//! - `missions.md`：任务看板
//! - `runs.jsonl`：每轮迭代一条 RunRecord
//! - `outbox.md` / `inbox.md`：与汇报 Worker 交换的消息
//! - `usage.json` / `usage.md`：用量账本
//! - `status.json`：调度循环结束时的状态标记
//! - `stop`：存在时调度器在当前迭代后结束

pub mod audit;
pub mod board;
pub mod mailbox;
pub mod mission;
pub mod store;

pub use audit::{AuditTrail, RunOutcome, RunRecord};
pub use board::{BoardCounts, MissionBoard, MissionDocument};
pub use mailbox::Mailbox;
pub use mission::{Mission, MissionContext, MissionStatus};
pub use store::{open_store, GitStore, LocalStore, VersionStore};

use std::path::{Path, PathBuf};

use thiserror::Error;

pub const STOP_FILE: &str = "stop";

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Mission board not found: {0}")]
    Missing(PathBuf),

    #[error("Mission not found: {0}")]
    NotFound(String),

    #[error("Mission {id} is {from}, expected {expected}")]
    InvalidTransition {
        id: String,
        from: MissionStatus,
        expected: MissionStatus,
    },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 请求调度器在当前迭代结束后停止
pub fn request_stop(root: &Path) -> std::io::Result<()> {
    std::fs::write(root.join(STOP_FILE), "stop requested\n")
}

/// 若存在停止请求则消费掉并返回 true
pub fn take_stop_request(root: &Path) -> bool {
    let path = root.join(STOP_FILE);
    if !path.exists() {
        return false;
    }
    if let Err(e) = std::fs::remove_file(&path) {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove stop file");
    }
    true
}
