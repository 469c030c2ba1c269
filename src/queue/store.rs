//! 队列的版本化存储：同步、暂存、有差异才提交、发布
//!
//! 四个操作彼此独立，调度器决定失败是否可以吸收。

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::QueueSection;
use crate::queue::QueueError;

#[async_trait]
pub trait VersionStore: Send + Sync {
    /// 拉取并合并远端变更
    async fn synchronize(&self) -> Result<(), QueueError>;

    async fn stage_all(&self) -> Result<(), QueueError>;

    /// 只有暂存区有差异时才提交；返回是否产生了新提交
    async fn commit_if_changed(&self, message: &str) -> Result<bool, QueueError>;

    async fn publish(&self) -> Result<(), QueueError>;
}

/// git 仓库实现
pub struct GitStore {
    root: PathBuf,
    author_name: String,
    author_email: String,
}

impl GitStore {
    pub fn new(root: impl AsRef<Path>, author_name: &str, author_email: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            author_name: author_name.to_string(),
            author_email: author_email.to_string(),
        }
    }

    pub fn is_repository(&self) -> bool {
        self.root.join(".git").exists()
    }

    async fn git(&self, args: &[&str]) -> Result<Output, QueueError> {
        Command::new("git")
            .arg("-c")
            .arg(format!("user.name={}", self.author_name))
            .arg("-c")
            .arg(format!("user.email={}", self.author_email))
            .args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| QueueError::Git {
                command: args.join(" "),
                stderr: format!("Failed to run git: {}", e),
            })
    }

    async fn git_ok(&self, args: &[&str]) -> Result<Output, QueueError> {
        let output = self.git(args).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(QueueError::Git {
                command: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    async fn has_remote(&self) -> Result<bool, QueueError> {
        let out = self.git_ok(&["remote"]).await?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }
}

#[async_trait]
impl VersionStore for GitStore {
    async fn synchronize(&self) -> Result<(), QueueError> {
        if !self.has_remote().await? {
            return Ok(());
        }
        if let Err(e) = self.git_ok(&["pull", "--rebase", "--autostash"]).await {
            // 冲突时回到拉取前的状态，继续使用本地视图
            let _ = self.git(&["rebase", "--abort"]).await;
            return Err(e);
        }
        Ok(())
    }

    async fn stage_all(&self) -> Result<(), QueueError> {
        self.git_ok(&["add", "-A"]).await.map(|_| ())
    }

    async fn commit_if_changed(&self, message: &str) -> Result<bool, QueueError> {
        let diff = self.git(&["diff", "--cached", "--quiet"]).await?;
        match diff.status.code() {
            Some(0) => return Ok(false),
            Some(1) => {}
            _ => {
                return Err(QueueError::Git {
                    command: "diff --cached --quiet".to_string(),
                    stderr: String::from_utf8_lossy(&diff.stderr).trim().to_string(),
                })
            }
        }
        self.git_ok(&["commit", "-m", message]).await?;
        Ok(true)
    }

    async fn publish(&self) -> Result<(), QueueError> {
        if !self.has_remote().await? {
            return Ok(());
        }
        self.git_ok(&["push"]).await.map(|_| ())
    }
}

/// 非版本化模式：所有操作都是空操作
pub struct LocalStore;

#[async_trait]
impl VersionStore for LocalStore {
    async fn synchronize(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn stage_all(&self) -> Result<(), QueueError> {
        Ok(())
    }

    async fn commit_if_changed(&self, _message: &str) -> Result<bool, QueueError> {
        Ok(false)
    }

    async fn publish(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

pub fn open_store(cfg: &QueueSection) -> Box<dyn VersionStore> {
    if cfg.versioned {
        Box::new(GitStore::new(&cfg.root, &cfg.author_name, &cfg.author_email))
    } else {
        Box::new(LocalStore)
    }
}
