//! Beekeeper - 长驻自动化守护进程
//!
//! 入口：解析子命令、加载配置、初始化日志，然后进入监管 / Worker / 诊断模式。
//! 退出码：配置或用法错误 2，启动前检查失败 1，其余稳态错误只记日志。

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};

use beekeeper::bridge::ReportingLoop;
use beekeeper::config::{load_config, AppConfig};
use beekeeper::core::{KeeperError, ShutdownManager};
use beekeeper::diagnostics;
use beekeeper::observability;
use beekeeper::scheduler::MissionScheduler;
use beekeeper::supervisor::{
    Heartbeat, SelfExecLauncher, Supervisor, WorkerKind, EXIT_INTERRUPTED,
};

#[derive(Parser)]
#[command(name = "beekeeper", version, about = "Supervise the mission scheduler and reporting loop")]
struct Cli {
    /// 配置文件路径（TOML）
    #[arg(short, long, global = true, env = "BEEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Run both workers under supervision (default)
    Start,
    /// Run only the mission scheduler under supervision
    Scheduler,
    /// Run only the reporting loop under supervision
    Bridge,
    /// Run the self-test suite
    Test,
    /// Open an interactive shell in the queue root
    Shell,
    /// Probe the supervisor heartbeat (exit 0 healthy, 1 stale)
    Health,
    /// Child entry point used by the supervisor
    #[command(hide = true)]
    Worker {
        #[arg(value_enum)]
        kind: WorkerKind,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    observability::init();

    let cfg = match load_config(cli.config.clone()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("beekeeper: invalid configuration: {}", e);
            return Ok(ExitCode::from(2));
        }
    };

    match cli.command.clone().unwrap_or(Commands::Start) {
        Commands::Start => {
            supervise(&cli, &cfg, &[WorkerKind::Scheduler, WorkerKind::Bridge]).await
        }
        Commands::Scheduler => supervise(&cli, &cfg, &[WorkerKind::Scheduler]).await,
        Commands::Bridge => supervise(&cli, &cfg, &[WorkerKind::Bridge]).await,
        Commands::Test => {
            let checks = diagnostics::self_test(&cfg).await;
            let ok = diagnostics::print_report(&checks);
            let effective =
                diagnostics::effective_config(&cfg).context("Failed to render configuration")?;
            println!("\n# Effective configuration\n{}", effective);
            Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Commands::Shell => {
            let code = diagnostics::interactive_shell(&cfg)
                .await
                .context("Failed to start shell")?;
            Ok(ExitCode::from(code.clamp(0, 255) as u8))
        }
        Commands::Health => {
            let threshold = Duration::from_secs(cfg.supervisor.stale_after_secs);
            let status = Heartbeat::check(&cfg.supervisor.heartbeat_path, threshold, Utc::now());
            println!("{:?}", status);
            Ok(if status.is_healthy() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Worker { kind } => run_worker(kind, &cfg).await,
    }
}

/// 启动前检查：队列、看板、后端可执行文件缺失时直接失败
fn preflight(cfg: &AppConfig, kinds: &[WorkerKind]) -> Result<(), KeeperError> {
    if kinds.contains(&WorkerKind::Scheduler) {
        MissionScheduler::from_config(cfg)?.preflight()?;
    }
    if !cfg.queue.root.is_dir() {
        return Err(KeeperError::QueueMissing(cfg.queue.root.clone()));
    }
    Ok(())
}

async fn supervise(cli: &Cli, cfg: &AppConfig, kinds: &[WorkerKind]) -> anyhow::Result<ExitCode> {
    preflight(cfg, kinds).context("Startup preflight failed")?;

    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let launcher =
        SelfExecLauncher::current(cli.config.clone()).context("Failed to locate own executable")?;
    let mut supervisor = Supervisor::new(&cfg.supervisor, Box::new(launcher), shutdown);

    let names: Vec<&str> = kinds.iter().map(|k| k.name()).collect();
    tracing::info!(workers = ?names, tick_secs = cfg.supervisor.tick_secs, "Supervisor starting");
    supervisor.start(kinds);
    supervisor.run().await;
    Ok(ExitCode::SUCCESS)
}

/// Worker 子进程入口。被信号取消时以 `EXIT_INTERRUPTED` 退出，监管进程会把它当作意外退出重启
async fn run_worker(kind: WorkerKind, cfg: &AppConfig) -> anyhow::Result<ExitCode> {
    let shutdown = ShutdownManager::new();
    shutdown.install_signal_handlers();

    let code = match kind {
        WorkerKind::Scheduler => {
            let scheduler =
                MissionScheduler::from_config(cfg).context("Failed to build mission scheduler")?;
            let summary = scheduler
                .run(shutdown.token())
                .await
                .context("Mission scheduler failed")?;
            tracing::info!(iterations = summary.iterations, exit = ?summary.exit, "Scheduler worker exiting");
            summary.exit.exit_code()
        }
        WorkerKind::Bridge => {
            let bridge = ReportingLoop::from_config(cfg).context("Failed to build reporting loop")?;
            // 汇报循环只会因取消而结束
            bridge.run(shutdown.token()).await;
            EXIT_INTERRUPTED
        }
    };
    Ok(ExitCode::from(code))
}
