//! Worker 描述与启动器
//!
//! 每个 Worker 是一个独立子进程：默认以 `beekeeper worker <kind>` 自我重启动。

use std::path::PathBuf;
use std::process::Stdio;

use chrono::{DateTime, Utc};
use tokio::process::{Child, Command};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum WorkerKind {
    /// 任务调度循环
    Scheduler,
    /// 汇报 / 收件循环
    Bridge,
}

impl WorkerKind {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerKind::Scheduler => "scheduler",
            WorkerKind::Bridge => "bridge",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Worker 收到取消（SIGTERM / Ctrl+C）后的退出码；0 只表示工作自然结束
pub const EXIT_INTERRUPTED: u8 = 143;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    /// 以状态码 0 正常结束，不再重启
    Finished,
    /// 启动失败或等待重启
    Down,
}

/// 监管进程独占的子进程记录
#[derive(Debug)]
pub struct WorkerDescriptor {
    pub kind: WorkerKind,
    pub name: String,
    pub child: Option<Child>,
    pub pid: Option<u32>,
    pub state: WorkerState,
    pub restarts: u32,
    pub last_seen: Option<DateTime<Utc>>,
}

impl WorkerDescriptor {
    pub fn new(kind: WorkerKind) -> Self {
        Self {
            kind,
            name: kind.name().to_string(),
            child: None,
            pid: None,
            state: WorkerState::Down,
            restarts: 0,
            last_seen: None,
        }
    }

    pub fn attach(&mut self, child: Child, now: DateTime<Utc>) {
        self.pid = child.id();
        self.child = Some(child);
        self.state = WorkerState::Running;
        self.last_seen = Some(now);
    }
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, kind: WorkerKind) -> std::io::Result<Child>;
}

/// 以当前可执行文件 + 隐藏子命令 `worker <kind>` 启动子进程，继承 stdio
pub struct SelfExecLauncher {
    exe: PathBuf,
    config_path: Option<PathBuf>,
}

impl SelfExecLauncher {
    pub fn new(exe: PathBuf, config_path: Option<PathBuf>) -> Self {
        Self { exe, config_path }
    }

    pub fn current(config_path: Option<PathBuf>) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, config_path))
    }
}

impl WorkerLauncher for SelfExecLauncher {
    fn launch(&self, kind: WorkerKind) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.exe);
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.arg("worker")
            .arg(kind.name())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
    }
}
