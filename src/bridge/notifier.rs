//! 通知出口：把 outbox 内容交给操作者
//!
//! 聊天通道本身不在本进程内：`CommandNotifier` 把消息写入外部命令的 stdin，
//! 由该命令负责投递。

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str) -> std::io::Result<()>;
}

/// 只写日志
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, message: &str) -> std::io::Result<()> {
        for line in message.lines().filter(|l| !l.trim().is_empty()) {
            tracing::info!(target: "beekeeper::outbox", "{}", line);
        }
        Ok(())
    }
}

/// 外部命令：argv[0] 为程序，消息从 stdin 写入，非零退出视为投递失败
pub struct CommandNotifier {
    argv: Vec<String>,
}

impl CommandNotifier {
    pub fn new(argv: Vec<String>) -> Option<Self> {
        if argv.first().map_or(true, |p| p.trim().is_empty()) {
            return None;
        }
        Some(Self { argv })
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn send(&self, message: &str) -> std::io::Result<()> {
        let mut child = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(message.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!(
                    "notify command exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))
        }
    }
}

pub fn notifier_from_config(notify_command: Option<&Vec<String>>) -> Box<dyn Notifier> {
    match notify_command.cloned().and_then(CommandNotifier::new) {
        Some(cmd) => Box::new(cmd),
        None => Box::new(LogNotifier),
    }
}
