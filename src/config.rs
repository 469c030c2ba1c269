//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEEKEEPER__*` 覆盖（双下划线表示嵌套，如 `BEEKEEPER__SCHEDULER__MAX_RUNS=3`）。
//! 所有键都有默认值：文件或键缺失时回落到默认值，不会让启动失败。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub queue: QueueSection,
    pub scheduler: SchedulerSection,
    pub budget: BudgetSection,
    pub provider: ProviderSection,
    pub supervisor: SupervisorSection,
    pub bridge: BridgeSection,
    /// 项目名 -> 本地路径，任务带 `[project:x]` 时据此决定工作目录
    pub projects: BTreeMap<String, PathBuf>,
}

/// [queue] 段：任务队列根目录（git 仓库）与提交身份
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub root: PathBuf,
    pub missions_file: String,
    /// false 时不做 git 同步（本地单机模式）
    pub versioned: bool,
    pub author_name: String,
    pub author_email: String,
    /// In Progress 认领超过该时长视为过期，可被重新领取
    pub claim_ttl_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            root: PathBuf::from("instance"),
            missions_file: "missions.md".to_string(),
            versioned: true,
            author_name: "beekeeper".to_string(),
            author_email: "beekeeper@localhost".to_string(),
            claim_ttl_secs: 7200,
        }
    }
}

impl QueueSection {
    pub fn missions_path(&self) -> PathBuf {
        self.root.join(&self.missions_file)
    }
}

/// [scheduler] 段：循环次数、间隔、任务工具与轮数上限
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub max_runs: u32,
    pub interval_secs: u64,
    pub mission_max_turns: u32,
    pub mission_tools: Vec<String>,
    /// 队列为空时是否执行一次探索（无队列身份的退化任务）
    pub explore_when_idle: bool,
    pub explore_max_turns: u32,
    pub explore_tools: Vec<String>,
    pub explore_prompt: String,
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    /// 认领者标识，未设置时用主机名
    pub owner: Option<String>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_runs: 20,
            interval_secs: 300,
            mission_max_turns: 25,
            mission_tools: ["Read", "Glob", "Grep", "Edit", "Write", "Bash"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            explore_when_idle: true,
            explore_max_turns: 10,
            explore_tools: ["Read", "Glob", "Grep"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            explore_prompt: "No mission is queued. Explore the project, look for something \
                             small and useful to improve, and write down what you found."
                .to_string(),
            model: None,
            fallback_model: None,
            owner: None,
        }
    }
}

impl SchedulerSection {
    pub fn owner(&self) -> String {
        self.owner.clone().unwrap_or_else(hostname)
    }
}

/// [budget] 段：会话窗口 / 周窗口上限与安全余量
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    /// 0 表示不限制该窗口
    pub session_token_limit: u64,
    pub weekly_token_limit: u64,
    /// 距上限不足该百分比即停止（用量上报本身有延迟）
    pub safety_margin_percent: u8,
    pub session_hours: u32,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            session_token_limit: 500_000,
            weekly_token_limit: 5_000_000,
            safety_margin_percent: 10,
            session_hours: 5,
        }
    }
}

/// [provider] 段：执行后端选择
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    /// claude / copilot / local / ollama-claude
    pub name: String,
    /// 覆盖 profile 中的可执行文件
    pub binary: Option<String>,
    /// 任务未指定项目路径时的工作目录
    pub workdir: Option<PathBuf>,
    pub timeout_secs: u64,
    /// 自定义端点（local / ollama-claude）；同名 `<前缀>_BASE_URL` 等环境变量优先
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// 请求未指定模型时使用的默认模型
    pub model: Option<String>,
    pub auth_token: Option<String>,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            name: "claude".to_string(),
            binary: None,
            workdir: None,
            timeout_secs: 3600,
            base_url: None,
            api_key: None,
            model: None,
            auth_token: None,
        }
    }
}

/// [supervisor] 段：监控周期、优雅终止宽限期、心跳
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub tick_secs: u64,
    pub grace_secs: u64,
    pub heartbeat_path: PathBuf,
    pub stale_after_secs: u64,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            tick_secs: 5,
            grace_secs: 10,
            heartbeat_path: std::env::temp_dir().join("beekeeper-heartbeat"),
            stale_after_secs: 120,
        }
    }
}

/// [bridge] 段：汇报循环轮询间隔与通知命令
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSection {
    pub poll_interval_secs: u64,
    /// 通知命令 argv，消息从 stdin 写入；未设置时只写日志
    pub notify_command: Option<Vec<String>>,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            notify_command: None,
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// 从 config 目录加载配置，环境变量 BEEKEEPER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEEKEEPER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEEKEEPER")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("scheduler.mission_tools")
            .with_list_parse_key("scheduler.explore_tools")
            .with_list_parse_key("bridge.notify_command")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
