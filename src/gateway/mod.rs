//! 规划 / 翻译网关：外部能力的窄契约
//!
//! 网关只负责生成；输出形态不受信任，由 normalize 在核心侧归一化与校验。
//! 每次调用都携带会话标签（GatewayContext），便于追踪与安全关联。

pub mod fake;
pub mod llm;
pub mod normalize;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::core::{SessionId, StepRecord};
use crate::llm::LlmError;

pub use fake::{FakePlanner, FakeTranslator};
pub use llm::{LlmPlanner, LlmTranslator};
pub use normalize::{normalize_command, normalize_plan};

/// 网关调用失败（生成本身失败，区别于输出无法归一化）
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

/// 会话级调用上下文
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayContext {
    pub session_id: SessionId,
    /// 稳定的会话标签，如 `terminus-<session_id>`
    pub tag: String,
}

impl GatewayContext {
    pub fn new(session_id: &str, prefix: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            tag: format!("{prefix}{session_id}"),
        }
    }
}

/// 规划网关的原始输出（可能是直接序列、JSON 或自由文本）
#[derive(Debug, Clone, PartialEq)]
pub enum RawPlan {
    Steps(Vec<String>),
    Json(serde_json::Value),
    Text(String),
}

/// 触发重规划的失败详情
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    pub step: String,
    pub command: Option<String>,
    pub error: String,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

/// 规划能力：produce a plan
#[async_trait]
pub trait PlanningGateway: Send + Sync {
    async fn create_plan(&self, ctx: &GatewayContext, goal: &str) -> Result<RawPlan, GatewayError>;

    async fn revise_plan(
        &self,
        ctx: &GatewayContext,
        goal: &str,
        history: &[StepRecord],
        failure: &FailureDetail,
    ) -> Result<RawPlan, GatewayError>;
}

/// 翻译能力：produce a command（返回值由核心强制为单行）
#[async_trait]
pub trait TranslationGateway: Send + Sync {
    async fn translate(&self, ctx: &GatewayContext, step: &str) -> Result<String, GatewayError>;
}
