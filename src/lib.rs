//! Beekeeper - 长驻自动化守护进程
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **observability**: tracing 日志初始化
//! - **core**: 错误分类、关闭 / 取消上下文
//! - **budget**: 预算闸门与用量账本
//! - **provider**: 执行后端能力 profile、纯函数翻译与子进程调用
//! - **queue**: 版本化任务队列（missions.md 看板、审计记录、收发件箱）
//! - **scheduler**: 有界任务调度循环
//! - **supervisor**: Worker 进程监管与心跳
//! - **bridge**: 汇报循环（outbox 投递、inbox 入队）
//! - **diagnostics**: 自检与交互式 shell

pub mod bridge;
pub mod budget;
pub mod config;
pub mod core;
pub mod diagnostics;
pub mod fsutil;
pub mod observability;
pub mod provider;
pub mod queue;
pub mod scheduler;
pub mod supervisor;

pub use config::{load_config, AppConfig};
pub use core::{KeeperError, ShutdownManager, ShutdownReason};
