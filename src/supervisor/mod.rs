//! 进程监管：Worker 描述表、启动器、监控周期与心跳

pub mod heartbeat;
pub mod monitor;
pub mod worker;

pub use heartbeat::{Heartbeat, HeartbeatStatus};
pub use monitor::Supervisor;
pub use worker::{
    SelfExecLauncher, EXIT_INTERRUPTED, WorkerDescriptor, WorkerKind, WorkerLauncher, WorkerState,
};
