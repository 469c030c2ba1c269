//! 任务调度 Worker：有界循环，把持久队列变成受预算约束、可崩溃恢复的执行流程

pub mod loop_;
pub mod status;

pub use loop_::{LoopExit, MissionScheduler, RunSummary, SchedulerDeps};
pub use status::{read_status, write_status, StatusMarker};
