//! 监管进程：启动 Worker、按固定周期轮询存活、崩溃即重启、写心跳、统一拆除
//!
//! 监控周期是唯一的轮询点，从不阻塞等待某个 Worker。关闭顺序：先 SIGTERM，
//! 宽限期内轮询退出，超时再强杀，最后全部回收后才返回。

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::process::Child;

use crate::config::SupervisorSection;
use crate::core::{ShutdownManager, ShutdownReason};
use crate::supervisor::heartbeat::Heartbeat;
use crate::supervisor::worker::{WorkerDescriptor, WorkerKind, WorkerLauncher, WorkerState};

const REAP_POLL: Duration = Duration::from_millis(100);

pub struct Supervisor {
    workers: Vec<WorkerDescriptor>,
    launcher: Box<dyn WorkerLauncher>,
    heartbeat: Heartbeat,
    shutdown: ShutdownManager,
    tick: Duration,
    grace: Duration,
    torn_down: bool,
}

impl Supervisor {
    pub fn new(
        cfg: &SupervisorSection,
        launcher: Box<dyn WorkerLauncher>,
        shutdown: ShutdownManager,
    ) -> Self {
        Self {
            workers: Vec::new(),
            launcher,
            heartbeat: Heartbeat::new(&cfg.heartbeat_path),
            shutdown,
            tick: Duration::from_secs(cfg.tick_secs.max(1)),
            grace: Duration::from_secs(cfg.grace_secs),
            torn_down: false,
        }
    }

    /// 测试用：亚秒级监控周期
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn workers(&self) -> &[WorkerDescriptor] {
        &self.workers
    }

    pub fn start(&mut self, kinds: &[WorkerKind]) {
        let now = Utc::now();
        for kind in kinds {
            let mut worker = WorkerDescriptor::new(*kind);
            match self.launcher.launch(*kind) {
                Ok(child) => {
                    worker.attach(child, now);
                    tracing::info!(worker = %worker.name, pid = ?worker.pid, "Worker started");
                }
                Err(e) => {
                    tracing::error!(worker = %worker.name, error = %e, "Worker launch failed, retrying next tick");
                }
            }
            self.workers.push(worker);
        }
    }

    /// 一个监控周期：检查每个 Worker，崩溃的立即重启，然后写心跳
    pub fn monitor_tick(&mut self, now: DateTime<Utc>) {
        if self.shutdown.is_shutdown() {
            return;
        }

        let launcher = &self.launcher;
        for worker in self.workers.iter_mut() {
            match worker.state {
                WorkerState::Finished => {}
                WorkerState::Down => relaunch(launcher.as_ref(), worker, now),
                WorkerState::Running => {
                    let polled = match worker.child.as_mut() {
                        Some(child) => child.try_wait(),
                        None => Ok(None),
                    };
                    match polled {
                        Ok(None) => worker.last_seen = Some(now),
                        Ok(Some(status)) => {
                            worker.child = None;
                            worker.pid = None;
                            if status.success() {
                                tracing::info!(worker = %worker.name, "Worker finished");
                                worker.state = WorkerState::Finished;
                            } else {
                                worker.restarts += 1;
                                tracing::warn!(
                                    worker = %worker.name,
                                    status = %status,
                                    restarts = worker.restarts,
                                    "Worker exited unexpectedly, restarting"
                                );
                                worker.state = WorkerState::Down;
                                relaunch(launcher.as_ref(), worker, now);
                            }
                        }
                        Err(e) => {
                            tracing::warn!(worker = %worker.name, error = %e, "Failed to poll worker");
                        }
                    }
                }
            }
        }

        if let Err(e) = self.heartbeat.beat(now) {
            tracing::warn!(path = %self.heartbeat.path().display(), error = %e, "Failed to write heartbeat");
        }

        if !self.workers.is_empty()
            && self
                .workers
                .iter()
                .all(|w| w.state == WorkerState::Finished)
        {
            self.shutdown.shutdown(ShutdownReason::WorkersFinished);
        }
    }

    /// 监控直到收到关闭请求，然后拆除全部子进程
    pub async fn run(&mut self) -> ShutdownReason {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let token = self.shutdown.token();

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.monitor_tick(Utc::now()),
            }
        }

        let reason = self
            .shutdown
            .reason()
            .unwrap_or(ShutdownReason::Interrupt);
        self.teardown(&reason).await;
        reason
    }

    /// 拆除：SIGTERM → 宽限期轮询 → 强杀 → 回收。重复调用返回 false 且不做任何事
    pub async fn teardown(&mut self, reason: &ShutdownReason) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;

        let mut live: Vec<(String, Child)> = self
            .workers
            .iter_mut()
            .filter_map(|w| {
                w.pid = None;
                w.child.take().map(|c| (w.name.clone(), c))
            })
            .collect();

        for (name, child) in live.iter_mut() {
            terminate(name, child);
        }

        let deadline = Instant::now() + self.grace;
        let mut exited = vec![false; live.len()];
        loop {
            for (i, (_, child)) in live.iter_mut().enumerate() {
                if !exited[i] {
                    exited[i] = !matches!(child.try_wait(), Ok(None));
                }
            }
            if exited.iter().all(|e| *e) || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(REAP_POLL).await;
        }

        let mut forced = 0;
        for (i, (name, child)) in live.iter_mut().enumerate() {
            if !exited[i] {
                forced += 1;
                tracing::warn!(worker = %name, "Worker ignored SIGTERM, killing");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(worker = %name, error = %e, "Failed to kill worker");
                }
            }
            let _ = child.wait().await;
        }

        for w in self.workers.iter_mut() {
            if w.state == WorkerState::Running {
                w.state = WorkerState::Down;
            }
        }

        tracing::info!(
            reason = %reason,
            workers = live.len(),
            forced,
            "Supervisor stopped"
        );
        true
    }
}

fn relaunch(launcher: &dyn WorkerLauncher, worker: &mut WorkerDescriptor, now: DateTime<Utc>) {
    match launcher.launch(worker.kind) {
        Ok(child) => {
            worker.attach(child, now);
            tracing::info!(worker = %worker.name, pid = ?worker.pid, restarts = worker.restarts, "Worker relaunched");
        }
        Err(e) => {
            worker.state = WorkerState::Down;
            tracing::error!(worker = %worker.name, error = %e, "Worker relaunch failed, retrying next tick");
        }
    }
}

#[cfg(unix)]
fn terminate(name: &str, child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!(worker = %name, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn terminate(name: &str, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(worker = %name, error = %e, "Terminate failed");
    }
}
