//! 预算闸门：根据当前用量决定 CONTINUE / HALT
//!
//! 用量上报本身是异步、滞后的，所以距上限还剩 `safety_margin_percent` 时就停止。

use serde::{Deserialize, Serialize};

use crate::config::BudgetSection;

/// 单个计量窗口：已用量与上限（上限 0 表示不限制）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageWindow {
    pub used: u64,
    pub limit: u64,
}

impl UsageWindow {
    pub fn new(used: u64, limit: u64) -> Self {
        Self { used, limit }
    }

    /// 已用百分比（封顶 100）；不限制的窗口返回 None
    pub fn percent_used(&self) -> Option<u8> {
        if self.limit == 0 {
            return None;
        }
        let pct = (self.used as u128 * 100) / self.limit as u128;
        Some(pct.min(100) as u8)
    }
}

/// 预算快照：会话窗口与周窗口
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetState {
    pub session: UsageWindow,
    pub weekly: UsageWindow,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetDecision {
    Continue,
    Halt { reason: String },
}

impl BudgetDecision {
    pub fn is_halt(&self) -> bool {
        matches!(self, BudgetDecision::Halt { .. })
    }
}

/// 无状态预算闸门，每轮迭代都可以安全调用
#[derive(Debug, Clone, Copy)]
pub struct BudgetGate {
    safety_margin_percent: u8,
}

impl BudgetGate {
    pub fn new(safety_margin_percent: u8) -> Self {
        Self {
            safety_margin_percent: safety_margin_percent.min(100),
        }
    }

    pub fn from_config(cfg: &BudgetSection) -> Self {
        Self::new(cfg.safety_margin_percent)
    }

    pub fn evaluate(&self, state: &BudgetState) -> BudgetDecision {
        for (name, window) in [("session", state.session), ("weekly", state.weekly)] {
            if window.limit == 0 {
                continue;
            }
            if window.used >= window.limit {
                return BudgetDecision::Halt {
                    reason: format!(
                        "{} budget exhausted ({}/{} tokens)",
                        name, window.used, window.limit
                    ),
                };
            }
            let threshold = (window.limit as u128
                * (100 - self.safety_margin_percent as u128))
                / 100;
            if window.used as u128 >= threshold {
                return BudgetDecision::Halt {
                    reason: format!(
                        "{} budget within {}% of ceiling ({}/{} tokens)",
                        name, self.safety_margin_percent, window.used, window.limit
                    ),
                };
            }
        }
        BudgetDecision::Continue
    }
}
