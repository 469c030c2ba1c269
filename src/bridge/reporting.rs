//! 汇报循环：inbox 指令入队，outbox 消息投递给操作者
//!
//! inbox 每行一条：`/stop` 请求调度器停止，`/status` 回一份队列摘要，其余内容作为新任务排队。
//! 投递失败时 outbox 保留，下次轮询重试。

use std::path::PathBuf;
use std::time::Duration;

use chrono::Local;
use tokio_util::sync::CancellationToken;

use crate::bridge::notifier::{notifier_from_config, Notifier};
use crate::config::AppConfig;
use crate::core::KeeperError;
use crate::queue::{request_stop, Mailbox, MissionBoard};
use crate::scheduler::read_status;

/// 单次轮询的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub commands: usize,
    pub delivered: bool,
}

pub struct ReportingLoop {
    root: PathBuf,
    board: MissionBoard,
    inbox: Mailbox,
    outbox: Mailbox,
    notifier: Box<dyn Notifier>,
    poll: Duration,
}

impl ReportingLoop {
    pub fn new(config: &AppConfig, notifier: Box<dyn Notifier>) -> Self {
        let root = config.queue.root.clone();
        Self {
            board: MissionBoard::new(config.queue.missions_path()),
            inbox: Mailbox::inbox(&root),
            outbox: Mailbox::outbox(&root),
            notifier,
            poll: Duration::from_secs(config.bridge.poll_interval_secs.max(1)),
            root,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, KeeperError> {
        if !config.queue.root.is_dir() {
            return Err(KeeperError::QueueMissing(config.queue.root.clone()));
        }
        Ok(Self::new(
            config,
            notifier_from_config(config.bridge.notify_command.as_ref()),
        ))
    }

    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(root = %self.root.display(), poll_secs = self.poll.as_secs(), "Reporting loop started");
        loop {
            self.poll_once().await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
        // 退出前最后投递一次
        self.deliver().await;
        tracing::info!("Reporting loop stopped");
    }

    pub async fn poll_once(&self) -> PollReport {
        let commands = self.handle_inbox();
        let delivered = self.deliver().await;
        PollReport {
            commands,
            delivered,
        }
    }

    fn handle_inbox(&self) -> usize {
        let content = match self.inbox.peek() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read inbox");
                return 0;
            }
        };

        let mut handled = 0;
        for line in content.lines() {
            let line = line.trim();
            let line = line.strip_prefix("- ").unwrap_or(line).trim();
            if line.is_empty() {
                continue;
            }
            self.handle_command(line);
            handled += 1;
        }

        if let Err(e) = self.inbox.consume(&content) {
            tracing::warn!(error = %e, "Failed to clear inbox");
        }
        handled
    }

    fn handle_command(&self, line: &str) {
        let reply = match line {
            "/stop" => match request_stop(&self.root) {
                Ok(()) => {
                    tracing::info!("Stop requested via inbox");
                    "Stop requested: the scheduler will end after the current iteration.".to_string()
                }
                Err(e) => format!("Could not request stop: {}", e),
            },
            "/status" => self.status_summary(),
            text => {
                let now = Local::now().naive_local();
                match self.board.update(|doc| Ok(doc.add_pending(text, now))) {
                    Ok(m) => {
                        tracing::info!(mission = %m.id, "Queued mission from inbox");
                        format!("Queued mission {}: {}", m.id, m.description)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to queue mission from inbox");
                        format!("Could not queue mission: {}", e)
                    }
                }
            }
        };
        if let Err(e) = self.outbox.append(&reply) {
            tracing::warn!(error = %e, "Failed to write outbox");
        }
    }

    fn status_summary(&self) -> String {
        let mut lines = Vec::new();
        match self.board.load() {
            Ok(doc) => {
                let c = doc.counts();
                lines.push(format!(
                    "Queue: {} pending, {} in progress, {} done, {} failed",
                    c.pending, c.in_progress, c.done, c.failed
                ));
                for m in doc.missions(crate::queue::MissionStatus::InProgress) {
                    lines.push(format!("Working on: {}", m.description));
                }
            }
            Err(e) => lines.push(format!("Queue unavailable: {}", e)),
        }
        if let Some(marker) = read_status(&self.root) {
            lines.push(format!(
                "Last loop: {} after {} iterations",
                marker.state, marker.iterations
            ));
        }
        if let Ok(usage) = std::fs::read_to_string(self.root.join(crate::budget::usage::USAGE_REPORT_FILE)) {
            lines.extend(
                usage
                    .lines()
                    .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
                    .map(|l| l.to_string()),
            );
        }
        lines.join("\n")
    }

    /// 投递 outbox；成功后只移除已投递的内容
    async fn deliver(&self) -> bool {
        let content = match self.outbox.peek() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read outbox");
                return false;
            }
        };
        if content.trim().is_empty() {
            return false;
        }
        match self.notifier.send(content.trim()).await {
            Ok(()) => {
                if let Err(e) = self.outbox.consume(&content) {
                    tracing::warn!(error = %e, "Failed to clear outbox");
                }
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Notification failed, keeping outbox");
                false
            }
        }
    }
}
