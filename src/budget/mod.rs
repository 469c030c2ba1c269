//! 预算：无状态的 BudgetGate 与用量账本
//!
//! 调度器只通过 `BudgetSource` 读取 `BudgetState`；用量由 `UsageReporter` 在后端调用后累加。

pub mod gate;
pub mod usage;

pub use gate::{BudgetDecision, BudgetGate, BudgetState, UsageWindow};
pub use usage::{BudgetSource, UsageLedger, UsageReporter, UsageState};
