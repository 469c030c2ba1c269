//! 用量账本：按会话窗口（默认 5 小时）与周窗口累加 token
//!
//! 状态保存在队列根目录的 usage.json，并同步渲染一份给人看的 usage.md。
//! 文件缺失或损坏时按全新状态处理，不影响调度。

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::budget::{BudgetState, UsageWindow};
use crate::config::BudgetSection;
use crate::fsutil::atomic_write;

pub const USAGE_STATE_FILE: &str = "usage.json";
pub const USAGE_REPORT_FILE: &str = "usage.md";

const WEEK_DAYS: i64 = 7;

/// 只读的预算来源（调度器只读不写）
pub trait BudgetSource: Send + Sync {
    fn current(&self, now: DateTime<Utc>) -> BudgetState;
}

/// 用量上报：后端调用结束后累加 token
pub trait UsageReporter: Send + Sync {
    fn record(&self, tokens: u64, now: DateTime<Utc>) -> std::io::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageState {
    pub session_start: DateTime<Utc>,
    pub session_tokens: u64,
    pub weekly_start: DateTime<Utc>,
    pub weekly_tokens: u64,
    pub runs: u64,
}

impl UsageState {
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            session_start: now,
            session_tokens: 0,
            weekly_start: now,
            weekly_tokens: 0,
            runs: 0,
        }
    }

    /// 窗口过期则归零并从 now 重新计时
    pub fn rolled(mut self, now: DateTime<Utc>, session_hours: u32) -> Self {
        if now - self.session_start >= Duration::hours(session_hours as i64) {
            self.session_start = now;
            self.session_tokens = 0;
            self.runs = 0;
        }
        if now - self.weekly_start >= Duration::days(WEEK_DAYS) {
            self.weekly_start = now;
            self.weekly_tokens = 0;
        }
        self
    }
}

/// 基于文件的用量账本
pub struct UsageLedger {
    state_path: PathBuf,
    report_path: PathBuf,
    limits: BudgetSection,
}

impl UsageLedger {
    pub fn new(root: &Path, limits: BudgetSection) -> Self {
        Self {
            state_path: root.join(USAGE_STATE_FILE),
            report_path: root.join(USAGE_REPORT_FILE),
            limits,
        }
    }

    pub fn load(&self, now: DateTime<Utc>) -> UsageState {
        let raw = match std::fs::read_to_string(&self.state_path) {
            Ok(raw) => raw,
            Err(_) => return UsageState::fresh(now),
        };
        match serde_json::from_str::<UsageState>(&raw) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(path = %self.state_path.display(), error = %e, "Corrupt usage state, starting fresh");
                UsageState::fresh(now)
            }
        }
    }

    fn budget_state(&self, state: &UsageState) -> BudgetState {
        BudgetState {
            session: UsageWindow::new(state.session_tokens, self.limits.session_token_limit),
            weekly: UsageWindow::new(state.weekly_tokens, self.limits.weekly_token_limit),
        }
    }

    /// 渲染 usage.md：Session (5hr) : 25% (reset in 3h 10m)
    pub fn render_report(&self, state: &UsageState, now: DateTime<Utc>) -> String {
        let budget = self.budget_state(state);
        let session_end = state.session_start + Duration::hours(self.limits.session_hours as i64);
        let weekly_end = state.weekly_start + Duration::days(WEEK_DAYS);

        let pct = |w: UsageWindow| match w.percent_used() {
            Some(p) => format!("{}%", p),
            None => "unlimited".to_string(),
        };

        format!(
            "# Usage\n\nSession ({}hr) : {} (reset in {})\nWeekly (7 day) : {} (reset in {})\nRuns : {}\n",
            self.limits.session_hours,
            pct(budget.session),
            format_remaining(session_end - now),
            pct(budget.weekly),
            format_remaining(weekly_end - now),
            state.runs,
        )
    }
}

impl BudgetSource for UsageLedger {
    fn current(&self, now: DateTime<Utc>) -> BudgetState {
        let state = self.load(now).rolled(now, self.limits.session_hours);
        self.budget_state(&state)
    }
}

impl UsageReporter for UsageLedger {
    fn record(&self, tokens: u64, now: DateTime<Utc>) -> std::io::Result<()> {
        let mut state = self.load(now).rolled(now, self.limits.session_hours);
        state.session_tokens = state.session_tokens.saturating_add(tokens);
        state.weekly_tokens = state.weekly_tokens.saturating_add(tokens);
        state.runs += 1;

        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        atomic_write(&self.state_path, &format!("{}\n", json))?;
        atomic_write(&self.report_path, &self.render_report(&state, now))
    }
}

fn format_remaining(d: Duration) -> String {
    let mins = d.num_minutes().max(0);
    let (days, hours, mins) = (mins / 1440, (mins % 1440) / 60, mins % 60);
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else {
        format!("{}m", mins)
    }
}
