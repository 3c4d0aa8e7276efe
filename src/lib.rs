//! Terminus - 目标驱动的 Shell 工作流编排引擎
//!
//! 自然语言目标 → 规划 → 逐步翻译为单行命令 → 沙箱执行 → 失败时重规划，
//! 每次状态迁移都推送到会话事件流。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、会话状态、会话引擎、注册表、会话监管、组件构建
//! - **events**: 事件类型与按会话的有序事件总线
//! - **gateway**: 规划 / 翻译网关契约、输出归一化、LLM 与离线实现
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: tracing 初始化、进程指标、启动就绪检查
//! - **sandbox**: 沙箱执行器（执行身份、命令筛查、有界输出、进程组终止）
//! - **server**: WebSocket 前端与 HTTP 健康检查（feature `server`）

pub mod config;
pub mod core;
pub mod events;
pub mod gateway;
pub mod llm;
pub mod observability;
pub mod sandbox;
#[cfg(feature = "server")]
pub mod server;

pub use crate::core::{
    create_engine_builder, EngineBuilder, SessionHandle, SessionRegistry, SessionStatus,
    TerminusError,
};
pub use crate::events::{CompletionStatus, Event, SessionEvent};
