//! 调度循环结束时写入的状态标记 status.json

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fsutil::atomic_write;

pub const STATUS_FILE: &str = "status.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMarker {
    /// completed / budget_halt / stop_requested / cancelled
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub iterations: u32,
    pub timestamp: DateTime<Utc>,
}

pub fn status_path(root: &Path) -> PathBuf {
    root.join(STATUS_FILE)
}

pub fn write_status(root: &Path, marker: &StatusMarker) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(marker)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    atomic_write(&status_path(root), &format!("{}\n", json))
}

pub fn read_status(root: &Path) -> Option<StatusMarker> {
    let raw = std::fs::read_to_string(status_path(root)).ok()?;
    serde_json::from_str(&raw).ok()
}
