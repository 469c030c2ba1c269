//! 规范调用 -> 后端命令行的纯函数翻译
//!
//! profile 不支持的能力直接省略，不报错；拒绝列表在只支持允许列表的后端上
//! 每次调用都按当前 `KNOWN_TOOLS` 重新求补集。空的允许列表表示"不给任何工具"，
//! 而不是"不加限制"。

use crate::provider::adapter::{Endpoint, InvocationRequest, ToolSelection};
use crate::provider::profile::{EndpointStyle, FlagStyle, ProviderProfile, KNOWN_TOOLS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    /// 是否请求了结构化输出（决定是否尝试解析 JSON）
    pub structured_output: bool,
    /// 追加到子进程环境中的变量
    pub env: Vec<(String, String)>,
}

pub fn translate(
    profile: &ProviderProfile,
    request: &InvocationRequest,
    endpoint: &Endpoint,
    binary_override: Option<&str>,
) -> CommandLine {
    let mut args = Vec::new();

    if let Some(flag) = profile.prompt_flag {
        args.push(flag.to_string());
    }
    args.push(request.task.clone());

    match &request.tools {
        ToolSelection::Allow(tools) => push_allow(profile, &known_only(tools), &mut args),
        ToolSelection::Deny(tools) => match profile.deny {
            Some(style) => {
                let native = native_names(profile, &known_only(tools));
                push_tools(style, &native, &mut args);
            }
            None => {
                let denied = known_only(tools);
                let complement: Vec<&str> = KNOWN_TOOLS
                    .iter()
                    .copied()
                    .filter(|t| !denied.contains(t))
                    .collect();
                push_allow(profile, &complement, &mut args);
            }
        },
    }

    let model = request.model.as_ref().or(endpoint.model.as_ref());
    if let (Some(flag), Some(model)) = (profile.model_flag, model) {
        args.push(flag.to_string());
        args.push(model.clone());
    }
    if let (Some(flag), Some(model)) = (profile.fallback_flag, &request.fallback_model) {
        args.push(flag.to_string());
        args.push(model.clone());
    }

    let structured_output = request.structured_output && profile.supports_structured_output();
    if structured_output {
        if let Some(extra) = profile.structured_args {
            args.extend(extra.iter().map(|s| s.to_string()));
        }
    }

    if let (Some(flag), Some(turns)) = (profile.max_turns_flag, request.max_turns) {
        if turns > 0 {
            args.push(flag.to_string());
            args.push(turns.to_string());
        }
    }

    let mut env = Vec::new();
    match profile.endpoint {
        EndpointStyle::Fixed => {}
        EndpointStyle::Flags { base_url, api_key } => {
            if let Some(url) = &endpoint.base_url {
                args.push(base_url.to_string());
                args.push(url.clone());
            }
            if let Some(key) = &endpoint.api_key {
                args.push(api_key.to_string());
                args.push(key.clone());
            }
        }
        EndpointStyle::Env {
            base_url,
            api_key,
            model,
            auth_token,
        } => {
            let vars = [
                (base_url, &endpoint.base_url),
                (api_key, &endpoint.api_key),
                (model, &endpoint.model),
                (auth_token, &endpoint.auth_token),
            ];
            env.extend(
                vars.into_iter()
                    .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone()))),
            );
        }
    }

    CommandLine {
        program: binary_override.unwrap_or(profile.binary).to_string(),
        args,
        structured_output,
        env,
    }
}

/// 只保留规范词表中的工具，去重并保持顺序
fn known_only(tools: &[String]) -> Vec<&'static str> {
    let mut out: Vec<&'static str> = Vec::new();
    for t in tools {
        if let Some(k) = KNOWN_TOOLS.iter().copied().find(|k| *k == t.as_str()) {
            if !out.contains(&k) {
                out.push(k);
            }
        } else {
            tracing::debug!(tool = %t, "Dropping unknown tool");
        }
    }
    out
}

fn native_names(profile: &ProviderProfile, canonical: &[&str]) -> Vec<&'static str> {
    canonical
        .iter()
        .filter_map(|t| profile.native_tool(t))
        .collect()
}

fn push_allow(profile: &ProviderProfile, canonical: &[&str], args: &mut Vec<String>) {
    if let Some(flag) = profile.allow_all_flag {
        if KNOWN_TOOLS.iter().all(|k| canonical.contains(k)) {
            args.push(flag.to_string());
            return;
        }
    }
    let native = native_names(profile, canonical);
    if native.is_empty() {
        match profile.allow {
            FlagStyle::Joined(flag) | FlagStyle::Spread(flag) => {
                args.push(flag.to_string());
                args.push(String::new());
            }
            FlagStyle::Repeated(flag) => {
                tracing::warn!(
                    provider = profile.name,
                    flag,
                    "Empty tool allow-list cannot be expressed, backend keeps its default permissions"
                );
            }
        }
        return;
    }
    push_tools(profile.allow, &native, args);
}

fn push_tools(style: FlagStyle, native: &[&str], args: &mut Vec<String>) {
    if native.is_empty() {
        return;
    }
    match style {
        FlagStyle::Joined(flag) => {
            args.push(flag.to_string());
            args.push(native.join(","));
        }
        FlagStyle::Spread(flag) => {
            args.push(flag.to_string());
            args.extend(native.iter().map(|s| s.to_string()));
        }
        FlagStyle::Repeated(flag) => {
            for n in native {
                args.push(flag.to_string());
                args.push(n.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::profile::{CLAUDE, COPILOT, LOCAL, OLLAMA_CLAUDE};

    fn request(tools: ToolSelection) -> InvocationRequest {
        InvocationRequest {
            task: "fix the build".to_string(),
            tools,
            model: Some("opus".to_string()),
            fallback_model: Some("sonnet".to_string()),
            max_turns: Some(25),
            structured_output: true,
            workdir: None,
        }
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_claude_full_invocation() {
        let cmd = translate(
            &CLAUDE,
            &request(ToolSelection::Allow(strings(&["Read", "Bash"]))),
            &Endpoint::default(),
            None,
        );
        assert_eq!(cmd.program, "claude");
        assert_eq!(cmd.args[0], "-p");
        assert_eq!(cmd.args[1], "fix the build");
        assert!(has_pair(&cmd.args, "--allowedTools", "Read,Bash"));
        assert!(has_pair(&cmd.args, "--model", "opus"));
        assert!(has_pair(&cmd.args, "--fallback-model", "sonnet"));
        assert!(has_pair(&cmd.args, "--output-format", "json"));
        assert!(has_pair(&cmd.args, "--max-turns", "25"));
        assert!(cmd.structured_output);
    }

    #[test]
    fn test_claude_deny_list_is_spread() {
        let cmd = translate(
            &CLAUDE,
            &request(ToolSelection::Deny(strings(&["Bash", "Write"]))),
            &Endpoint::default(),
            None,
        );
        let idx = cmd.args.iter().position(|a| a == "--disallowedTools").unwrap();
        assert_eq!(cmd.args[idx + 1], "Bash");
        assert_eq!(cmd.args[idx + 2], "Write");
    }

    #[test]
    fn test_unknown_tools_are_dropped() {
        let cmd = translate(
            &CLAUDE,
            &request(ToolSelection::Allow(strings(&["Read", "Teleport", "Read"]))),
            &Endpoint::default(),
            None,
        );
        assert!(has_pair(&cmd.args, "--allowedTools", "Read"));
        assert!(!cmd.args.iter().any(|a| a.contains("Teleport")));
    }

    #[test]
    fn test_copilot_never_emits_unsupported_features() {
        let cmd = translate(
            &COPILOT,
            &request(ToolSelection::Allow(strings(&["Read"]))),
            &Endpoint::default(),
            None,
        );
        assert!(!cmd.args.iter().any(|a| a == "--fallback-model"));
        assert!(!cmd.args.iter().any(|a| a == "--output-format"));
        assert!(!cmd.args.iter().any(|a| a == "--max-turns"));
        assert!(!cmd.structured_output);
        assert!(has_pair(&cmd.args, "--allow-tool", "read_file"));
        assert!(has_pair(&cmd.args, "--model", "opus"));
    }

    #[test]
    fn test_copilot_deny_list_becomes_complement() {
        let cmd = translate(
            &COPILOT,
            &request(ToolSelection::Deny(strings(&["Bash", "Write"]))),
            &Endpoint::default(),
            None,
        );
        let allowed: Vec<&str> = cmd
            .args
            .windows(2)
            .filter(|w| w[0] == "--allow-tool")
            .map(|w| w[1].as_str())
            .collect();
        assert_eq!(allowed, vec!["read_file", "edit_file", "glob", "grep"]);
        assert!(!cmd.args.iter().any(|a| a == "shell" || a == "write_file"));
    }

    #[test]
    fn test_copilot_full_allow_uses_single_flag() {
        let all: Vec<String> = KNOWN_TOOLS.iter().map(|s| s.to_string()).collect();
        let cmd = translate(
            &COPILOT,
            &request(ToolSelection::Allow(all)),
            &Endpoint::default(),
            None,
        );
        assert!(cmd.args.iter().any(|a| a == "--allow-all-tools"));
        assert!(!cmd.args.iter().any(|a| a == "--allow-tool"));
    }

    #[test]
    fn test_zero_turn_bound_is_omitted() {
        let mut req = request(ToolSelection::Allow(strings(&["Read"])));
        req.max_turns = Some(0);
        let cmd = translate(
            &LOCAL,
            &req,
            &Endpoint::default(),
            None,
        );
        assert!(!cmd.args.iter().any(|a| a == "--max-turns"));
        assert!(has_pair(&cmd.args, "--allowed-tools", "Read"));
        assert!(!cmd.args.iter().any(|a| a == "--fallback-model"));
    }

    #[test]
    fn test_binary_override() {
        let cmd = translate(
            &CLAUDE,
            &request(ToolSelection::Allow(vec![])),
            &Endpoint::default(),
            Some("/opt/bin/claude"),
        );
        assert_eq!(cmd.program, "/opt/bin/claude");
    }

    #[test]
    fn test_empty_allow_list_restricts_everything() {
        let cmd = translate(
            &CLAUDE,
            &request(ToolSelection::Allow(vec![])),
            &Endpoint::default(),
            None,
        );
        assert!(has_pair(&cmd.args, "--allowedTools", ""));

        // 只剩未知工具时同样是空列表
        let cmd = translate(
            &LOCAL,
            &request(ToolSelection::Allow(strings(&["Teleport"]))),
            &Endpoint::default(),
            None,
        );
        assert!(has_pair(&cmd.args, "--allowed-tools", ""));
    }

    #[test]
    fn test_copilot_empty_allow_list_grants_nothing_explicit() {
        let all: Vec<String> = KNOWN_TOOLS.iter().map(|s| s.to_string()).collect();
        for tools in [ToolSelection::Allow(vec![]), ToolSelection::Deny(all)] {
            let cmd = translate(&COPILOT, &request(tools), &Endpoint::default(), None);
            assert!(!cmd.args.iter().any(|a| a == "--allow-tool"));
            assert!(!cmd.args.iter().any(|a| a == "--allow-all-tools"));
        }
    }

    #[test]
    fn test_local_endpoint_flags() {
        let endpoint = Endpoint {
            base_url: Some("http://localhost:11434/v1".to_string()),
            api_key: Some("sk-local".to_string()),
            model: Some("qwen2.5-coder".to_string()),
            auth_token: None,
        };
        let mut req = request(ToolSelection::Allow(strings(&["Read"])));
        req.model = None;
        let cmd = translate(&LOCAL, &req, &endpoint, None);
        assert!(has_pair(&cmd.args, "--base-url", "http://localhost:11434/v1"));
        assert!(has_pair(&cmd.args, "--api-key", "sk-local"));
        // 请求没带模型时用端点的默认模型
        assert!(has_pair(&cmd.args, "--model", "qwen2.5-coder"));
        assert!(cmd.env.is_empty());

        let keyless = Endpoint {
            api_key: None,
            ..endpoint
        };
        let cmd = translate(&LOCAL, &request(ToolSelection::Allow(vec![])), &keyless, None);
        assert!(!cmd.args.iter().any(|a| a == "--api-key"));
        assert!(has_pair(&cmd.args, "--model", "opus"));
    }

    #[test]
    fn test_ollama_claude_injects_env() {
        let endpoint = Endpoint {
            base_url: Some("http://localhost:11434".to_string()),
            api_key: Some("ollama".to_string()),
            model: Some("llama3.3".to_string()),
            auth_token: Some("tok".to_string()),
        };
        let mut req = request(ToolSelection::Allow(strings(&["Read", "Bash"])));
        req.model = None;
        let cmd = translate(&OLLAMA_CLAUDE, &req, &endpoint, None);

        assert_eq!(cmd.program, "claude");
        assert!(has_pair(&cmd.args, "--allowedTools", "Read,Bash"));
        assert!(has_pair(&cmd.args, "--model", "llama3.3"));
        assert!(!cmd.args.iter().any(|a| a == "--fallback-model" || a == "--base-url"));

        let env = |k: &str| cmd.env.iter().find(|(n, _)| n == k).map(|(_, v)| v.as_str());
        assert_eq!(env("ANTHROPIC_BASE_URL"), Some("http://localhost:11434"));
        assert_eq!(env("ANTHROPIC_API_KEY"), Some("ollama"));
        assert_eq!(env("ANTHROPIC_MODEL"), Some("llama3.3"));
        assert_eq!(env("ANTHROPIC_AUTH_TOKEN"), Some("tok"));

        let no_token = Endpoint {
            auth_token: None,
            ..endpoint
        };
        let cmd = translate(&OLLAMA_CLAUDE, &req, &no_token, None);
        assert!(!cmd.env.iter().any(|(n, _)| n == "ANTHROPIC_AUTH_TOKEN"));
    }

    #[test]
    fn test_fixed_backend_has_no_endpoint_output() {
        let endpoint = Endpoint {
            base_url: Some("http://ignored".to_string()),
            ..Endpoint::default()
        };
        let cmd = translate(
            &CLAUDE,
            &request(ToolSelection::Allow(strings(&["Read"]))),
            &endpoint,
            None,
        );
        assert!(cmd.env.is_empty());
        assert!(!cmd.args.iter().any(|a| a.contains("ignored")));
    }
}
