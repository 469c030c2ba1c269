//! ProviderAdapter：以子进程方式调用执行后端
//!
//! 超时或取消时子进程随 future 一起被丢弃（kill_on_drop）。退出码、stdout、stderr
//! 原样透传，后端报告的失败永远不会被改写成成功。

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::ProviderSection;
use crate::provider::profile::{lookup, EndpointStyle, ProviderProfile};
use crate::provider::translate::translate;
use crate::provider::ProviderError;

/// 工具限制：允许列表或拒绝列表（规范工具名）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSelection {
    Allow(Vec<String>),
    Deny(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub task: String,
    pub tools: ToolSelection,
    pub model: Option<String>,
    pub fallback_model: Option<String>,
    /// 内部推理轮数上限；0 或 None 表示不限制
    pub max_turns: Option<u32>,
    pub structured_output: bool,
    pub workdir: Option<PathBuf>,
}

/// 解析后的端点设置。每一项依次取 `<前缀>_<键>` 环境变量、[provider] 配置、profile 默认值
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub auth_token: Option<String>,
}

impl Endpoint {
    pub fn resolve(
        profile: &ProviderProfile,
        cfg: &ProviderSection,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        if !profile.supports_endpoint() {
            return Self::default();
        }
        let non_empty = |v: &String| !v.trim().is_empty();
        let pick = |key: &str, configured: &Option<String>, default: Option<&str>| {
            profile
                .env_prefix
                .and_then(|prefix| env(&format!("{}_{}", prefix, key)))
                .filter(non_empty)
                .or_else(|| configured.clone().filter(non_empty))
                .or_else(|| default.map(str::to_string))
        };
        Self {
            base_url: pick("BASE_URL", &cfg.base_url, profile.default_base_url),
            api_key: pick("API_KEY", &cfg.api_key, profile.default_api_key),
            model: pick("MODEL", &cfg.model, None),
            auth_token: pick("AUTH_TOKEN", &cfg.auth_token, None),
        }
    }

    /// 环境变量注入式后端没有 base_url 或 model 就无法工作
    fn validate(&self, profile: &ProviderProfile) -> Result<(), ProviderError> {
        if !matches!(profile.endpoint, EndpointStyle::Env { .. }) {
            return Ok(());
        }
        let missing = if self.base_url.is_none() {
            Some("base_url")
        } else if self.model.is_none() {
            Some("model")
        } else {
            None
        };
        match missing {
            Some(setting) => Err(ProviderError::EndpointMissing {
                provider: profile.name.to_string(),
                setting,
            }),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// 结构化输出中的 result 字段，或原始 stdout
    pub output: String,
    pub error: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// 调度器依赖的调用接口（测试中可替换为假实现）
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult, ProviderError>;
}

pub struct ProviderAdapter {
    profile: &'static ProviderProfile,
    binary_override: Option<String>,
    timeout: Duration,
    endpoint: Endpoint,
}

impl ProviderAdapter {
    pub fn new(profile: &'static ProviderProfile, binary_override: Option<String>, timeout: Duration) -> Self {
        Self {
            profile,
            binary_override,
            timeout,
            endpoint: Endpoint::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn from_config(cfg: &ProviderSection) -> Result<Self, ProviderError> {
        let profile =
            lookup(&cfg.name).ok_or_else(|| ProviderError::UnknownProvider(cfg.name.clone()))?;
        let endpoint = Endpoint::resolve(profile, cfg, |key| std::env::var(key).ok());
        endpoint.validate(profile)?;
        if let Some(url) = &endpoint.base_url {
            tracing::debug!(provider = profile.name, base_url = %url, "Using custom endpoint");
        }
        Ok(Self::new(
            profile,
            cfg.binary.clone(),
            Duration::from_secs(cfg.timeout_secs.max(1)),
        )
        .with_endpoint(endpoint))
    }

    pub fn profile(&self) -> &'static ProviderProfile {
        self.profile
    }

    pub fn program(&self) -> &str {
        self.binary_override.as_deref().unwrap_or(self.profile.binary)
    }

    /// 在 PATH 中定位后端可执行文件（启动前检查）
    pub fn resolve_binary(&self) -> Option<PathBuf> {
        find_in_path(self.program())
    }
}

#[async_trait]
impl Invoker for ProviderAdapter {
    async fn invoke(
        &self,
        request: &InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult, ProviderError> {
        let cmd = translate(
            self.profile,
            request,
            &self.endpoint,
            self.binary_override.as_deref(),
        );
        let env_keys: Vec<&str> = cmd.env.iter().map(|(k, _)| k.as_str()).collect();
        tracing::debug!(program = %cmd.program, args = ?cmd.args, env = ?env_keys, "Invoking backend");

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(cmd.env.iter().map(|(k, v)| (k, v)))
            .kill_on_drop(true);
        if let Some(dir) = &request.workdir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| ProviderError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            r = tokio::time::timeout(self.timeout, child.wait_with_output()) => match r {
                Ok(out) => out?,
                Err(_) => return Err(ProviderError::Timeout(self.timeout.as_secs())),
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let mut success = output.status.success();

        let (text, usage) = if cmd.structured_output {
            match serde_json::from_str::<Value>(stdout.trim()) {
                Ok(json) => {
                    if json.get("is_error").and_then(|v| v.as_bool()) == Some(true) {
                        success = false;
                    }
                    let text = json
                        .get("result")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| stdout.clone());
                    (text, extract_usage(&json))
                }
                Err(_) => (stdout.clone(), None),
            }
        } else {
            (stdout.clone(), None)
        };

        let error = if success {
            None
        } else if !stderr.trim().is_empty() {
            Some(stderr.trim().to_string())
        } else {
            Some(match output.status.code() {
                Some(code) => format!("backend exited with status {}", code),
                None => "backend terminated by signal".to_string(),
            })
        };

        Ok(InvocationResult {
            success,
            exit_code: output.status.code(),
            output: text,
            error,
            usage,
        })
    }
}

/// 从结构化输出中提取 token 用量：顶层字段、`usage` 子对象，或 stats/metadata/session
pub fn extract_usage(json: &Value) -> Option<TokenUsage> {
    fn read(v: &Value) -> Option<TokenUsage> {
        let get = |k: &str| v.get(k).and_then(|x| x.as_u64()).unwrap_or(0);
        let usage = TokenUsage {
            input_tokens: get("input_tokens"),
            output_tokens: get("output_tokens"),
        };
        (usage.total() > 0).then_some(usage)
    }

    if let Some(u) = read(json) {
        return Some(u);
    }
    ["usage", "stats", "metadata", "session"]
        .iter()
        .filter_map(|k| json.get(*k))
        .find_map(read)
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}
