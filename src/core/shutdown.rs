//! 优雅关闭：取消上下文与幂等的关闭请求
//!
//! 系统信号（Ctrl+C / SIGTERM）与「所有 Worker 已退出」两条路径都汇聚到 `ShutdownManager::shutdown`：
//! 只有第一次调用生效并记录原因，之后的调用是空操作。
//! Worker 循环拿 `token()` 在循环边界、后端调用与 sleep 处检查取消。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM 信号
    Terminate,
    /// 所有受监管的 Worker 都已正常结束
    WorkersFinished,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Interrupt => write!(f, "interrupt"),
            ShutdownReason::Terminate => write!(f, "terminate signal"),
            ShutdownReason::WorkersFinished => write!(f, "all workers finished"),
        }
    }
}

/// 关闭信号管理器（Clone 共享同一状态）
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    started: Arc<AtomicBool>,
    reason: Arc<OnceLock<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取消 token（传入 Worker 循环）
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 请求关闭；返回 true 表示本次调用发起了关闭，重复调用返回 false 且不做任何事
    pub fn shutdown(&self, reason: ShutdownReason) -> bool {
        if self
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(reason = %reason, "Shutdown already in progress, ignoring");
            return false;
        }
        tracing::info!(reason = %reason, "Shutdown requested");
        let _ = self.reason.set(reason);
        self.token.cancel();
        true
    }

    pub fn is_shutdown(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// 第一次关闭请求的原因
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.get().cloned()
    }

    /// 等待关闭信号
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }
}
