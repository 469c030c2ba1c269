//! 诊断：`beekeeper test` 自检与 `beekeeper shell` 交互式 shell

use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;

use crate::config::AppConfig;
use crate::provider::ProviderAdapter;
use crate::queue::MissionBoard;
use crate::supervisor::{Heartbeat, HeartbeatStatus};

/// 单项检查结果；required 项失败时自检以非零码退出
#[derive(Debug, Clone)]
pub struct Check {
    pub name: &'static str,
    pub ok: bool,
    pub required: bool,
    pub detail: String,
}

impl Check {
    fn pass(name: &'static str, required: bool, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: true,
            required,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, required: bool, detail: impl Into<String>) -> Self {
        Self {
            name,
            ok: false,
            required,
            detail: detail.into(),
        }
    }
}

pub async fn self_test(cfg: &AppConfig) -> Vec<Check> {
    let mut checks = vec![Check::pass(
        "config",
        true,
        format!("provider={} queue={}", cfg.provider.name, cfg.queue.root.display()),
    )];

    let root = &cfg.queue.root;
    checks.push(if root.is_dir() {
        Check::pass("queue root", true, root.display().to_string())
    } else {
        Check::fail("queue root", true, format!("{} does not exist", root.display()))
    });

    let board = MissionBoard::new(cfg.queue.missions_path());
    checks.push(match board.load() {
        Ok(doc) => {
            let c = doc.counts();
            Check::pass(
                "mission board",
                true,
                format!(
                    "{} pending, {} in progress, {} done, {} failed",
                    c.pending, c.in_progress, c.done, c.failed
                ),
            )
        }
        Err(e) => Check::fail("mission board", true, e.to_string()),
    });

    checks.push(check_git(cfg).await);

    checks.push(match ProviderAdapter::from_config(&cfg.provider) {
        Ok(adapter) => match adapter.resolve_binary() {
            Some(path) => Check::pass("backend", true, path.display().to_string()),
            None => Check::fail(
                "backend",
                true,
                format!("{} not found in PATH", adapter.program()),
            ),
        },
        Err(e) => Check::fail("backend", true, e.to_string()),
    });

    let threshold = Duration::from_secs(cfg.supervisor.stale_after_secs);
    checks.push(
        match Heartbeat::check(&cfg.supervisor.heartbeat_path, threshold, Utc::now()) {
            HeartbeatStatus::Fresh { age_secs } => {
                Check::pass("heartbeat", false, format!("{}s old", age_secs))
            }
            HeartbeatStatus::Stale { age_secs } => {
                Check::fail("heartbeat", false, format!("stale ({}s old)", age_secs))
            }
            HeartbeatStatus::Missing => {
                Check::fail("heartbeat", false, "no heartbeat (supervisor not running)")
            }
        },
    );

    checks
}

async fn check_git(cfg: &AppConfig) -> Check {
    if !cfg.queue.versioned {
        return Check::pass("git", false, "queue is not versioned");
    }
    let version = Command::new("git").arg("--version").output().await;
    match version {
        Ok(out) if out.status.success() => {
            let v = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if cfg.queue.root.join(".git").exists() {
                Check::pass("git", true, v)
            } else {
                Check::fail("git", true, format!("{} is not a git repository", cfg.queue.root.display()))
            }
        }
        Ok(out) => Check::fail("git", true, String::from_utf8_lossy(&out.stderr).trim().to_string()),
        Err(e) => Check::fail("git", true, format!("git not available: {}", e)),
    }
}

/// 打印检查结果；返回所有必需项是否通过
pub fn print_report(checks: &[Check]) -> bool {
    for c in checks {
        let mark = match (c.ok, c.required) {
            (true, _) => "ok  ",
            (false, true) => "FAIL",
            (false, false) => "warn",
        };
        println!("[{}] {:<14} {}", mark, c.name, c.detail);
    }
    checks.iter().all(|c| c.ok || !c.required)
}

/// 生效配置（密钥打码）
pub fn effective_config(cfg: &AppConfig) -> Result<String, toml::ser::Error> {
    let mut shown = cfg.clone();
    for secret in [&mut shown.provider.api_key, &mut shown.provider.auth_token] {
        if secret.is_some() {
            *secret = Some("***".to_string());
        }
    }
    toml::to_string_pretty(&shown)
}

/// 在队列根目录启动交互式 $SHELL，返回其退出码
pub async fn interactive_shell(cfg: &AppConfig) -> std::io::Result<i32> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let dir = if cfg.queue.root.is_dir() {
        cfg.queue.root.clone()
    } else {
        std::env::current_dir()?
    };
    tracing::info!(shell = %shell, dir = %dir.display(), "Starting diagnostic shell");
    let status = Command::new(&shell).current_dir(&dir).status().await?;
    Ok(status.code().unwrap_or(1))
}
