//! 会话事件：每次状态迁移对应一个事件，序列化为 `{"type": ..., "payload": {...}}`

use serde::{Deserialize, Serialize};

use crate::core::SessionId;

/// 终态结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Success,
    Failed,
}

/// 引擎产生的事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    /// 规划成功（初始计划或重规划后的完整当前计划）
    PlanGenerated { plan: Vec<String> },
    /// 步骤进入执行
    StepExecuting {
        step: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    /// 执行结果
    StepResult {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    /// 步骤失败或会话级错误
    ErrorDetected { error: String, failed_step: String },
    /// 开始重规划
    RePlanning {},
    /// 终态
    WorkflowComplete { status: CompletionStatus },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::PlanGenerated { .. } => "plan_generated",
            Event::StepExecuting { .. } => "step_executing",
            Event::StepResult { .. } => "step_result",
            Event::ErrorDetected { .. } => "error_detected",
            Event::RePlanning {} => "re_planning",
            Event::WorkflowComplete { .. } => "workflow_complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::WorkflowComplete { .. })
    }
}

/// 带会话 ID 与序号的事件记录（序号在会话内从 0 递增）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub seq: u64,
    #[serde(flatten)]
    pub event: Event,
}
