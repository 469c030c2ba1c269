//! 心跳：每个监控周期写一次 unix 秒时间戳，外部探针按文件内容判断存活
//!
//! 时间戳单调不减：系统时钟回拨时沿用上一次的值。

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::fsutil::atomic_write;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Fresh { age_secs: u64 },
    Stale { age_secs: u64 },
    Missing,
}

impl HeartbeatStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HeartbeatStatus::Fresh { .. })
    }
}

#[derive(Debug)]
pub struct Heartbeat {
    path: PathBuf,
    last: u64,
}

impl Heartbeat {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            last: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 写入心跳，返回实际写入的时间戳
    pub fn beat(&mut self, now: DateTime<Utc>) -> std::io::Result<u64> {
        let ts = (now.timestamp().max(0) as u64).max(self.last);
        atomic_write(&self.path, &format!("{}\n", ts))?;
        self.last = ts;
        Ok(ts)
    }

    pub fn read(path: &Path) -> Option<u64> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    /// 外部探针约定：心跳年龄超过 threshold 即视为整个监管进程卡死
    pub fn check(path: &Path, threshold: Duration, now: DateTime<Utc>) -> HeartbeatStatus {
        let Some(ts) = Self::read(path) else {
            return HeartbeatStatus::Missing;
        };
        let age_secs = (now.timestamp().max(0) as u64).saturating_sub(ts);
        if age_secs > threshold.as_secs() {
            HeartbeatStatus::Stale { age_secs }
        } else {
            HeartbeatStatus::Fresh { age_secs }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_beat_never_goes_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let mut hb = Heartbeat::new(dir.path().join("hb"));
        let t1 = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        assert_eq!(hb.beat(t1).unwrap(), 1_700_000_100);
        assert_eq!(hb.beat(t0).unwrap(), 1_700_000_100);
        assert_eq!(Heartbeat::read(hb.path()), Some(1_700_000_100));
    }

    #[test]
    fn test_check_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hb");
        let threshold = Duration::from_secs(120);
        let written = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        assert_eq!(Heartbeat::check(&path, threshold, written), HeartbeatStatus::Missing);

        Heartbeat::new(&path).beat(written).unwrap();
        let soon = Utc.timestamp_opt(1_700_000_060, 0).unwrap();
        assert!(Heartbeat::check(&path, threshold, soon).is_healthy());

        let late = Utc.timestamp_opt(1_700_000_121, 0).unwrap();
        assert_eq!(
            Heartbeat::check(&path, threshold, late),
            HeartbeatStatus::Stale { age_secs: 121 }
        );
    }
}
