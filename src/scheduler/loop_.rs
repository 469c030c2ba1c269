//! 调度主循环
//!
//! 每轮：同步 → 回收过期认领 → 预算检查（HALT 结束整个循环）→ 选任务 → 认领并落盘
//! → 调用后端 → done/failed → 记录用量 → RunRecord + outbox → 暂存/有差异才提交/发布 → 休眠。
//! 取消令牌在循环边界、后端调用期间和休眠时检查。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use tokio_util::sync::CancellationToken;

use crate::budget::{BudgetDecision, BudgetGate, BudgetSource, UsageLedger, UsageReporter};
use crate::config::{AppConfig, QueueSection, SchedulerSection};
use crate::core::KeeperError;
use crate::provider::{
    InvocationRequest, InvocationResult, Invoker, ProviderAdapter, ProviderError, ToolSelection,
};
use crate::queue::{
    open_store, take_stop_request, AuditTrail, Mailbox, Mission, MissionBoard, QueueError,
    RunOutcome, RunRecord, VersionStore,
};
use crate::scheduler::status::{write_status, StatusMarker};
use crate::supervisor::EXIT_INTERRUPTED;

/// 循环结束原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// 达到 max_runs
    Completed,
    BudgetHalt(String),
    StopRequested,
    Cancelled,
}

impl LoopExit {
    /// Worker 进程退出码：只有被取消才非零，监管进程据此判断需要重启
    pub fn exit_code(&self) -> u8 {
        match self {
            LoopExit::Cancelled => EXIT_INTERRUPTED,
            LoopExit::Completed | LoopExit::BudgetHalt(_) | LoopExit::StopRequested => 0,
        }
    }

    fn state(&self) -> &'static str {
        match self {
            LoopExit::Completed => "completed",
            LoopExit::BudgetHalt(_) => "budget_halt",
            LoopExit::StopRequested => "stop_requested",
            LoopExit::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u32,
    pub done: u32,
    pub failed: u32,
    pub explored: u32,
    pub exit: LoopExit,
}

/// 外部协作者（测试中替换为假实现）
pub struct SchedulerDeps {
    pub store: Arc<dyn VersionStore>,
    pub invoker: Arc<dyn Invoker>,
    pub budget: Arc<dyn BudgetSource>,
    pub usage: Arc<dyn UsageReporter>,
}

enum Work {
    Mission(Mission),
    Explore,
}

enum IterationOutcome {
    Ran { success: bool, explored: bool },
    Idle,
    Cancelled,
}

pub struct MissionScheduler {
    cfg: SchedulerSection,
    queue: QueueSection,
    projects: BTreeMap<String, PathBuf>,
    default_workdir: Option<PathBuf>,
    gate: BudgetGate,
    board: MissionBoard,
    audit: AuditTrail,
    outbox: Mailbox,
    owner: String,
    deps: SchedulerDeps,
}

impl MissionScheduler {
    pub fn new(config: &AppConfig, deps: SchedulerDeps) -> Self {
        let root = &config.queue.root;
        Self {
            cfg: config.scheduler.clone(),
            queue: config.queue.clone(),
            projects: config.projects.clone(),
            default_workdir: config.provider.workdir.clone(),
            gate: BudgetGate::from_config(&config.budget),
            board: MissionBoard::new(config.queue.missions_path()),
            audit: AuditTrail::new(root),
            outbox: Mailbox::outbox(root),
            owner: config.scheduler.owner(),
            deps,
        }
    }

    /// 用真实的后端、git 存储与用量账本组装
    pub fn from_config(config: &AppConfig) -> Result<Self, KeeperError> {
        let adapter = ProviderAdapter::from_config(&config.provider)?;
        if adapter.resolve_binary().is_none() {
            return Err(KeeperError::BackendMissing(adapter.program().to_string()));
        }
        let ledger = Arc::new(UsageLedger::new(&config.queue.root, config.budget.clone()));
        let deps = SchedulerDeps {
            store: Arc::from(open_store(&config.queue)),
            invoker: Arc::new(adapter),
            budget: ledger.clone(),
            usage: ledger,
        };
        Ok(Self::new(config, deps))
    }

    /// 队列根目录、看板（以及版本化时的 git 仓库）必须存在
    pub fn preflight(&self) -> Result<(), KeeperError> {
        let root = &self.queue.root;
        if !root.is_dir() {
            return Err(KeeperError::QueueMissing(root.clone()));
        }
        if !self.board.exists() {
            return Err(KeeperError::QueueMissing(self.board.path().to_path_buf()));
        }
        if self.queue.versioned && !root.join(".git").exists() {
            return Err(KeeperError::QueueMissing(root.join(".git")));
        }
        Ok(())
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary, KeeperError> {
        self.preflight()?;

        let owner = self.owner.clone();
        let recovered = self.board.update(|doc| Ok(doc.recover(&owner)))?;
        for m in &recovered {
            tracing::info!(mission = %m.id, "Recovered interrupted mission back to pending");
        }

        tracing::info!(
            max_runs = self.cfg.max_runs,
            interval_secs = self.cfg.interval_secs,
            owner = %self.owner,
            "Mission scheduler started"
        );

        let mut summary = RunSummary {
            iterations: 0,
            done: 0,
            failed: 0,
            explored: 0,
            exit: LoopExit::Completed,
        };

        let exit = loop {
            if summary.iterations >= self.cfg.max_runs {
                break LoopExit::Completed;
            }
            if cancel.is_cancelled() {
                break LoopExit::Cancelled;
            }
            if take_stop_request(&self.queue.root) {
                tracing::info!("Stop requested, ending mission loop");
                break LoopExit::StopRequested;
            }

            if let Err(e) = self.deps.store.synchronize().await {
                tracing::warn!(error = %e, "Queue sync failed, proceeding with local view");
            }

            let ttl = chrono::Duration::seconds(self.queue.claim_ttl_secs as i64);
            let now = Local::now().naive_local();
            match self.board.update(|doc| Ok(doc.reclaim_stale(now, ttl))) {
                Ok(reclaimed) => {
                    for m in reclaimed {
                        tracing::warn!(mission = %m.id, owner = ?m.owner, "Reclaimed stale claim");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to reclaim stale claims"),
            }

            let budget = self.deps.budget.current(Utc::now());
            if let BudgetDecision::Halt { reason } = self.gate.evaluate(&budget) {
                tracing::warn!(reason = %reason, iteration = summary.iterations + 1, "Budget gate halted the loop");
                self.notify(&format!("Budget halt: {}", reason));
                break LoopExit::BudgetHalt(reason);
            }

            let iteration = summary.iterations + 1;
            let outcome = match self.run_iteration(iteration, &cancel).await {
                Ok(o) => o,
                Err(e) => {
                    tracing::warn!(iteration, error = %e, "Iteration aborted by queue error");
                    IterationOutcome::Idle
                }
            };
            summary.iterations = iteration;

            match outcome {
                IterationOutcome::Ran { explored: true, .. } => summary.explored += 1,
                IterationOutcome::Ran { success: true, .. } => summary.done += 1,
                IterationOutcome::Ran { success: false, .. } => summary.failed += 1,
                IterationOutcome::Idle => {}
                IterationOutcome::Cancelled => break LoopExit::Cancelled,
            }

            if summary.iterations >= self.cfg.max_runs {
                break LoopExit::Completed;
            }

            tokio::select! {
                _ = cancel.cancelled() => break LoopExit::Cancelled,
                _ = tokio::time::sleep(Duration::from_secs(self.cfg.interval_secs)) => {}
            }
        };

        summary.exit = exit;
        self.finish(&summary).await;
        Ok(summary)
    }

    async fn run_iteration(
        &self,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> Result<IterationOutcome, QueueError> {
        let owner = self.owner.clone();
        let now = Local::now().naive_local();
        let explore = self.cfg.explore_when_idle;

        let work = self.board.update(|doc| {
            let Some(next) = doc.next_pending().map(|m| m.id.clone()) else {
                return Ok(if explore { Some(Work::Explore) } else { None });
            };
            doc.claim(&next, &owner, now).map(|m| Some(Work::Mission(m)))
        })?;

        let Some(work) = work else {
            tracing::info!(iteration, "No pending mission and exploration disabled");
            return Ok(IterationOutcome::Idle);
        };

        let (request, mission) = match work {
            Work::Mission(m) => {
                tracing::info!(iteration, mission = %m.id, description = %m.description, "Starting mission");
                // 认领先落盘并发布，让其他机器尽早看到
                self.persist(&format!("beekeeper: start {}", m.id), true).await;
                (self.mission_request(&m), Some(m))
            }
            Work::Explore => {
                tracing::info!(iteration, "Queue empty, running idle exploration");
                (self.explore_request(), None)
            }
        };

        let started = Instant::now();
        let result = self.deps.invoker.invoke(&request, cancel).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match result {
            Ok(r) => r,
            Err(ProviderError::Cancelled) => {
                if let Some(m) = &mission {
                    let id = m.id.clone();
                    match self.board.update(|doc| doc.release(&id)) {
                        Ok(_) => tracing::info!(mission = %m.id, "Invocation cancelled, claim released"),
                        Err(e) => tracing::warn!(mission = %m.id, error = %e, "Failed to release claim"),
                    }
                    self.persist(&format!("beekeeper: release {}", m.id), false).await;
                }
                return Ok(IterationOutcome::Cancelled);
            }
            Err(e) => InvocationResult {
                success: false,
                exit_code: None,
                output: String::new(),
                error: Some(e.to_string()),
                usage: None,
            },
        };

        let finished = Local::now().naive_local();
        if let Some(m) = &mission {
            let id = m.id.clone();
            let closed = if result.success {
                self.board.update(|doc| doc.complete(&id, finished))
            } else {
                self.board.update(|doc| doc.fail(&id, finished))
            };
            if let Err(e) = closed {
                tracing::warn!(mission = %m.id, error = %e, "Failed to close mission on board");
            }
        }

        let tokens = result.usage.map(|u| u.total());
        if let Some(tokens) = tokens {
            if let Err(e) = self.deps.usage.record(tokens, Utc::now()) {
                tracing::warn!(error = %e, "Failed to record usage");
            }
        }

        let description = mission
            .as_ref()
            .map(|m| m.description.clone())
            .unwrap_or_else(|| "idle exploration".to_string());
        let record = RunRecord {
            timestamp: Utc::now(),
            iteration,
            mission_id: mission.as_ref().map(|m| m.id.clone()),
            description: description.clone(),
            outcome: if result.success {
                RunOutcome::Success
            } else {
                RunOutcome::Failure
            },
            duration_ms,
            error: result.error.clone(),
            tokens,
        };
        self.append_record(&record);

        let verb = if result.success { "done" } else { "failed" };
        match &result.error {
            Some(err) if !result.success => {
                tracing::warn!(iteration, duration_ms, error = %err, "Iteration {}: {}", verb, description);
                self.notify(&format!("Mission {}: {} ({})", verb, description, first_line(err)));
            }
            _ => {
                tracing::info!(iteration, duration_ms, "Iteration {}: {}", verb, description);
                self.notify(&format!("Mission {}: {}", verb, description));
            }
        }

        self.persist(&format!("beekeeper: {} {}", verb, description), true)
            .await;

        Ok(IterationOutcome::Ran {
            success: result.success,
            explored: mission.is_none(),
        })
    }

    fn append_record(&self, record: &RunRecord) {
        if let Err(e) = self.audit.append(record) {
            tracing::warn!(error = %e, "Failed to append run record");
        }
    }

    fn mission_request(&self, mission: &Mission) -> InvocationRequest {
        InvocationRequest {
            task: mission.description.clone(),
            tools: ToolSelection::Allow(self.cfg.mission_tools.clone()),
            model: self.cfg.model.clone(),
            fallback_model: self.cfg.fallback_model.clone(),
            max_turns: Some(self.cfg.mission_max_turns),
            structured_output: true,
            workdir: self.workdir_for(mission),
        }
    }

    fn explore_request(&self) -> InvocationRequest {
        InvocationRequest {
            task: self.cfg.explore_prompt.clone(),
            tools: ToolSelection::Allow(self.cfg.explore_tools.clone()),
            model: self.cfg.model.clone(),
            fallback_model: self.cfg.fallback_model.clone(),
            max_turns: Some(self.cfg.explore_max_turns),
            structured_output: true,
            workdir: self.default_workdir.clone(),
        }
    }

    /// 工作目录：`[path:]` 优先，其次 `[project:]` 对应的配置路径，最后是 provider.workdir
    fn workdir_for(&self, mission: &Mission) -> Option<PathBuf> {
        if let Some(path) = &mission.context.path {
            return Some(path.clone());
        }
        if let Some(project) = &mission.context.project {
            match self.projects.get(project) {
                Some(path) => return Some(path.clone()),
                None => tracing::warn!(project = %project, "Unknown project, using default workdir"),
            }
        }
        self.default_workdir.clone()
    }

    fn notify(&self, message: &str) {
        if let Err(e) = self.outbox.append(message) {
            tracing::warn!(error = %e, "Failed to write outbox");
        }
    }

    /// 暂存 → 有差异才提交 → 发布；失败只记日志
    async fn persist(&self, message: &str, publish: bool) {
        let store = &self.deps.store;
        if let Err(e) = store.stage_all().await {
            tracing::warn!(error = %e, "Failed to stage queue changes");
            return;
        }
        match store.commit_if_changed(message).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("No queue changes to commit");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to commit queue changes");
                return;
            }
        }
        if publish {
            if let Err(e) = store.publish().await {
                tracing::warn!(error = %e, "Publish failed, result kept locally");
            }
        }
    }

    async fn finish(&self, summary: &RunSummary) {
        let reason = match &summary.exit {
            LoopExit::BudgetHalt(r) => Some(r.clone()),
            _ => None,
        };
        let marker = StatusMarker {
            state: summary.exit.state().to_string(),
            reason,
            iterations: summary.iterations,
            timestamp: Utc::now(),
        };
        if let Err(e) = write_status(&self.queue.root, &marker) {
            tracing::warn!(error = %e, "Failed to write status marker");
        }
        let publish = summary.exit != LoopExit::Cancelled;
        self.persist(&format!("beekeeper: loop {}", marker.state), publish)
            .await;

        tracing::info!(
            iterations = summary.iterations,
            done = summary.done,
            failed = summary.failed,
            explored = summary.explored,
            exit = marker.state,
            "Mission scheduler finished"
        );
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetState, UsageWindow};
    use crate::queue::{MissionDocument, MissionStatus};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::Mutex;

    struct NullStore;

    #[async_trait]
    impl VersionStore for NullStore {
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

    struct Unlimited;

    impl BudgetSource for Unlimited {
        fn current(&self, _now: DateTime<Utc>) -> BudgetState {
            BudgetState::default()
        }
    }

    impl UsageReporter for Unlimited {
        fn record(&self, _tokens: u64, _now: DateTime<Utc>) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingInvoker {
        requests: Mutex<Vec<InvocationRequest>>,
    }

    #[async_trait]
    impl Invoker for RecordingInvoker {
        async fn invoke(
            &self,
            request: &InvocationRequest,
            _cancel: &CancellationToken,
        ) -> Result<InvocationResult, ProviderError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(InvocationResult {
                success: true,
                exit_code: Some(0),
                output: "ok".to_string(),
                error: None,
                usage: None,
            })
        }
    }

    fn setup(board: &str) -> (tempfile::TempDir, AppConfig) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("missions.md"), board).unwrap();
        let mut cfg = AppConfig::default();
        cfg.queue.root = dir.path().to_path_buf();
        cfg.queue.versioned = false;
        cfg.scheduler.interval_secs = 0;
        cfg.scheduler.max_runs = 1;
        cfg.scheduler.owner = Some("box1".to_string());
        (dir, cfg)
    }

    fn deps(invoker: Arc<RecordingInvoker>) -> SchedulerDeps {
        SchedulerDeps {
            store: Arc::new(NullStore),
            invoker,
            budget: Arc::new(Unlimited),
            usage: Arc::new(Unlimited),
        }
    }

    #[tokio::test]
    async fn test_preflight_fails_without_board() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.queue.root = dir.path().to_path_buf();
        cfg.queue.versioned = false;
        let invoker = Arc::new(RecordingInvoker::default());
        let scheduler = MissionScheduler::new(&cfg, deps(invoker.clone()));
        let err = scheduler.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, KeeperError::QueueMissing(_)));
        assert!(invoker.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_preflight_requires_repository_when_versioned() {
        let (_dir, mut cfg) = setup("## Pending\n");
        cfg.queue.versioned = true;
        let scheduler = MissionScheduler::new(&cfg, deps(Arc::new(RecordingInvoker::default())));
        assert!(matches!(
            scheduler.preflight(),
            Err(KeeperError::QueueMissing(_))
        ));
    }

    #[tokio::test]
    async fn test_project_tag_resolves_workdir() {
        let (_dir, mut cfg) = setup("## Pending\n\n- [project:web] fix css\n");
        cfg.projects.insert("web".to_string(), PathBuf::from("/srv/web"));
        let invoker = Arc::new(RecordingInvoker::default());
        let scheduler = MissionScheduler::new(&cfg, deps(invoker.clone()));
        scheduler.run(CancellationToken::new()).await.unwrap();

        let requests = invoker.requests.lock().unwrap();
        assert_eq!(requests[0].workdir, Some(PathBuf::from("/srv/web")));
        assert_eq!(requests[0].task, "fix css");
        assert_eq!(requests[0].max_turns, Some(25));
        assert!(matches!(&requests[0].tools, ToolSelection::Allow(t) if t.contains(&"Bash".to_string())));
    }

    #[tokio::test]
    async fn test_idle_exploration_is_read_only_and_lighter() {
        let (dir, cfg) = setup("## Pending\n");
        let invoker = Arc::new(RecordingInvoker::default());
        let scheduler = MissionScheduler::new(&cfg, deps(invoker.clone()));
        let summary = scheduler.run(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.explored, 1);

        let requests = invoker.requests.lock().unwrap();
        assert_eq!(requests[0].max_turns, Some(10));
        assert!(matches!(&requests[0].tools, ToolSelection::Allow(t) if !t.contains(&"Bash".to_string())));

        let records = AuditTrail::new(dir.path()).read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].mission_id.is_none());
    }

    #[tokio::test]
    async fn test_idle_without_exploration_invokes_nothing() {
        let (dir, mut cfg) = setup("## Pending\n");
        cfg.scheduler.explore_when_idle = false;
        let invoker = Arc::new(RecordingInvoker::default());
        let scheduler = MissionScheduler::new(&cfg, deps(invoker.clone()));
        let summary = scheduler.run(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.iterations, 1);
        assert!(invoker.requests.lock().unwrap().is_empty());
        assert!(AuditTrail::new(dir.path()).read_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recovers_own_claims_at_startup() {
        let (dir, cfg) = setup(
            "## Pending\n\n## In Progress\n\n- half done ▶(2026-02-12T04:00) [owner:box1]\n",
        );
        let invoker = Arc::new(RecordingInvoker::default());
        let scheduler = MissionScheduler::new(&cfg, deps(invoker.clone()));
        scheduler.run(CancellationToken::new()).await.unwrap();

        assert_eq!(invoker.requests.lock().unwrap()[0].task, "half done");
        let text = std::fs::read_to_string(dir.path().join("missions.md")).unwrap();
        assert_eq!(MissionDocument::parse(&text).counts().done, 1);
        assert_eq!(
            MissionDocument::parse(&text).missions(MissionStatus::InProgress).len(),
            0
        );
    }

    #[tokio::test]
    async fn test_stop_file_ends_loop_before_work() {
        let (dir, cfg) = setup("## Pending\n\n- task\n");
        crate::queue::request_stop(dir.path()).unwrap();
        let invoker = Arc::new(RecordingInvoker::default());
        let scheduler = MissionScheduler::new(&cfg, deps(invoker.clone()));
        let summary = scheduler.run(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.exit, LoopExit::StopRequested);
        assert_eq!(summary.iterations, 0);
        assert!(invoker.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_budget_window_near_limit_halts() {
        struct NearlyFull;
        impl BudgetSource for NearlyFull {
            fn current(&self, _now: DateTime<Utc>) -> BudgetState {
                BudgetState {
                    session: UsageWindow::new(95, 100),
                    weekly: UsageWindow::new(0, 0),
                }
            }
        }
        let (dir, cfg) = setup("## Pending\n\n- task\n");
        let invoker = Arc::new(RecordingInvoker::default());
        let scheduler = MissionScheduler::new(
            &cfg,
            SchedulerDeps {
                store: Arc::new(NullStore),
                invoker: invoker.clone(),
                budget: Arc::new(NearlyFull),
                usage: Arc::new(Unlimited),
            },
        );
        let summary = scheduler.run(CancellationToken::new()).await.unwrap();
        assert!(matches!(summary.exit, LoopExit::BudgetHalt(_)));
        let marker = crate::scheduler::read_status(dir.path()).unwrap();
        assert_eq!(marker.state, "budget_halt");
        let outbox = Mailbox::outbox(dir.path()).peek().unwrap();
        assert!(outbox.contains("Budget halt"));
    }

    #[test]
    fn test_only_cancellation_exits_non_zero() {
        assert_eq!(LoopExit::Completed.exit_code(), 0);
        assert_eq!(LoopExit::BudgetHalt("session".to_string()).exit_code(), 0);
        assert_eq!(LoopExit::StopRequested.exit_code(), 0);
        assert_eq!(LoopExit::Cancelled.exit_code(), EXIT_INTERRUPTED);
        assert_ne!(EXIT_INTERRUPTED, 0);
    }
}
