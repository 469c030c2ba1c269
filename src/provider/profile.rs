//! 后端能力 profile：只有数据，没有分支逻辑

/// 规范工具词表（调用方只使用这些名字）
pub const KNOWN_TOOLS: &[&str] = &["Bash", "Read", "Write", "Edit", "Glob", "Grep"];

/// 工具列表在命令行上的表达方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagStyle {
    /// `--flag A,B`
    Joined(&'static str),
    /// `--flag A B`
    Spread(&'static str),
    /// `--flag A --flag B`
    Repeated(&'static str),
}

/// 自定义端点（base_url / api_key / model）怎样交给后端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointStyle {
    /// 后端只连自己的官方服务
    Fixed,
    /// `--base-url URL [--api-key KEY]`，model 走 `model_flag`
    Flags {
        base_url: &'static str,
        api_key: &'static str,
    },
    /// 通过子进程环境变量注入；base_url 与 model 都是必填
    Env {
        base_url: &'static str,
        api_key: &'static str,
        model: &'static str,
        auth_token: &'static str,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct ProviderProfile {
    pub name: &'static str,
    pub binary: &'static str,
    /// 任务文本前的参数（如 `-p`）
    pub prompt_flag: Option<&'static str>,
    /// 规范名 -> 原生名；不在表中的工具会被丢弃
    pub tool_names: &'static [(&'static str, &'static str)],
    pub allow: FlagStyle,
    /// None 表示只能表达允许列表
    pub deny: Option<FlagStyle>,
    /// 全部工具都允许时使用的单个开关
    pub allow_all_flag: Option<&'static str>,
    pub model_flag: Option<&'static str>,
    pub fallback_flag: Option<&'static str>,
    /// 结构化输出参数；None 表示只能拿到纯文本
    pub structured_args: Option<&'static [&'static str]>,
    pub max_turns_flag: Option<&'static str>,
    pub endpoint: EndpointStyle,
    /// 端点设置的环境变量前缀，如 `BEEKEEPER_LOCAL` -> `BEEKEEPER_LOCAL_BASE_URL`
    pub env_prefix: Option<&'static str>,
    pub default_base_url: Option<&'static str>,
    pub default_api_key: Option<&'static str>,
}

impl ProviderProfile {
    pub fn native_tool(&self, canonical: &str) -> Option<&'static str> {
        self.tool_names
            .iter()
            .find(|(c, _)| *c == canonical)
            .map(|(_, n)| *n)
    }

    pub fn supports_fallback(&self) -> bool {
        self.fallback_flag.is_some()
    }

    pub fn supports_structured_output(&self) -> bool {
        self.structured_args.is_some()
    }

    pub fn supports_turn_bound(&self) -> bool {
        self.max_turns_flag.is_some()
    }

    pub fn supports_deny_list(&self) -> bool {
        self.deny.is_some()
    }

    pub fn supports_endpoint(&self) -> bool {
        self.endpoint != EndpointStyle::Fixed
    }
}

const IDENTITY_TOOLS: &[(&str, &str)] = &[
    ("Bash", "Bash"),
    ("Read", "Read"),
    ("Write", "Write"),
    ("Edit", "Edit"),
    ("Glob", "Glob"),
    ("Grep", "Grep"),
];

pub static CLAUDE: ProviderProfile = ProviderProfile {
    name: "claude",
    binary: "claude",
    prompt_flag: Some("-p"),
    tool_names: IDENTITY_TOOLS,
    allow: FlagStyle::Joined("--allowedTools"),
    deny: Some(FlagStyle::Spread("--disallowedTools")),
    allow_all_flag: None,
    model_flag: Some("--model"),
    fallback_flag: Some("--fallback-model"),
    structured_args: Some(&["--output-format", "json"]),
    max_turns_flag: Some("--max-turns"),
    endpoint: EndpointStyle::Fixed,
    env_prefix: None,
    default_base_url: None,
    default_api_key: None,
};

pub static COPILOT: ProviderProfile = ProviderProfile {
    name: "copilot",
    binary: "copilot",
    prompt_flag: Some("-p"),
    tool_names: &[
        ("Bash", "shell"),
        ("Read", "read_file"),
        ("Write", "write_file"),
        ("Edit", "edit_file"),
        ("Glob", "glob"),
        ("Grep", "grep"),
    ],
    allow: FlagStyle::Repeated("--allow-tool"),
    deny: None,
    allow_all_flag: Some("--allow-all-tools"),
    model_flag: Some("--model"),
    fallback_flag: None,
    structured_args: None,
    max_turns_flag: None,
    endpoint: EndpointStyle::Fixed,
    env_prefix: None,
    default_base_url: None,
    default_api_key: None,
};

/// OpenAI 兼容的本地 runner
pub static LOCAL: ProviderProfile = ProviderProfile {
    name: "local",
    binary: "beekeeper-local-runner",
    prompt_flag: Some("-p"),
    tool_names: IDENTITY_TOOLS,
    allow: FlagStyle::Joined("--allowed-tools"),
    deny: Some(FlagStyle::Joined("--disallowed-tools")),
    allow_all_flag: None,
    model_flag: Some("--model"),
    fallback_flag: None,
    structured_args: Some(&["--output-format", "json"]),
    max_turns_flag: Some("--max-turns"),
    endpoint: EndpointStyle::Flags {
        base_url: "--base-url",
        api_key: "--api-key",
    },
    env_prefix: Some("BEEKEEPER_LOCAL"),
    default_base_url: Some("http://localhost:11434/v1"),
    default_api_key: None,
};

/// 官方 claude CLI 指向 Anthropic 兼容代理（如 Ollama）
pub static OLLAMA_CLAUDE: ProviderProfile = ProviderProfile {
    name: "ollama-claude",
    binary: "claude",
    prompt_flag: Some("-p"),
    tool_names: IDENTITY_TOOLS,
    allow: FlagStyle::Joined("--allowedTools"),
    deny: Some(FlagStyle::Spread("--disallowedTools")),
    allow_all_flag: None,
    model_flag: Some("--model"),
    fallback_flag: None,
    structured_args: Some(&["--output-format", "json"]),
    max_turns_flag: Some("--max-turns"),
    endpoint: EndpointStyle::Env {
        base_url: "ANTHROPIC_BASE_URL",
        api_key: "ANTHROPIC_API_KEY",
        model: "ANTHROPIC_MODEL",
        auth_token: "ANTHROPIC_AUTH_TOKEN",
    },
    env_prefix: Some("BEEKEEPER_OLLAMA_CLAUDE"),
    default_base_url: None,
    default_api_key: Some("ollama"),
};

static PROFILES: &[&ProviderProfile] = &[&CLAUDE, &COPILOT, &LOCAL, &OLLAMA_CLAUDE];

/// 按后端名查 profile（大小写不敏感）
pub fn lookup(name: &str) -> Option<&'static ProviderProfile> {
    let name = name.trim().to_lowercase();
    PROFILES.iter().copied().find(|p| p.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_known_and_unknown() {
        assert_eq!(lookup("claude").map(|p| p.name), Some("claude"));
        assert_eq!(lookup(" Copilot ").map(|p| p.name), Some("copilot"));
        assert_eq!(lookup("Ollama-Claude").map(|p| p.name), Some("ollama-claude"));
        assert!(lookup("gpt-cli").is_none());
    }

    #[test]
    fn test_capabilities() {
        assert!(CLAUDE.supports_fallback());
        assert!(CLAUDE.supports_deny_list());
        assert!(!COPILOT.supports_fallback());
        assert!(!COPILOT.supports_structured_output());
        assert!(!COPILOT.supports_turn_bound());
        assert!(!COPILOT.supports_deny_list());
        assert!(LOCAL.supports_turn_bound());
        assert!(!LOCAL.supports_fallback());
        assert!(LOCAL.supports_endpoint());
        assert!(!CLAUDE.supports_endpoint());
        assert!(!COPILOT.supports_endpoint());
        // 与 claude 共用命令行，但代理不提供 fallback
        assert_eq!(OLLAMA_CLAUDE.binary, CLAUDE.binary);
        assert_eq!(OLLAMA_CLAUDE.allow, CLAUDE.allow);
        assert!(!OLLAMA_CLAUDE.supports_fallback());
        assert!(OLLAMA_CLAUDE.supports_endpoint());
    }

    #[test]
    fn test_every_profile_maps_full_vocabulary() {
        for p in PROFILES {
            for tool in KNOWN_TOOLS {
                assert!(p.native_tool(tool).is_some(), "{} lacks {}", p.name, tool);
            }
        }
        assert_eq!(COPILOT.native_tool("Bash"), Some("shell"));
    }
}
