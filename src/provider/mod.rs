//! 执行后端适配：能力 profile 查表 + 纯函数翻译 + 子进程调用
//!
//! 新增后端只需要在 `profile.rs` 里加一条静态数据。

pub mod adapter;
pub mod profile;
pub mod translate;

pub use adapter::{
    Endpoint, InvocationRequest, InvocationResult, Invoker, ProviderAdapter, TokenUsage, ToolSelection,
};
pub use profile::{lookup, EndpointStyle, FlagStyle, ProviderProfile, KNOWN_TOOLS};
pub use translate::{translate, CommandLine};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider {provider} requires {setting}")]
    EndpointMissing {
        provider: String,
        setting: &'static str,
    },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend timed out after {0}s")]
    Timeout(u64),

    #[error("Invocation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
