//! 会话错误分类
//!
//! 步骤级错误（翻译失败、执行超时）走重规划路径；致命错误（初始规划失败、执行身份不可用）直接终止会话。

use std::time::Duration;

use thiserror::Error;

use crate::sandbox::SandboxError;

/// 引擎与注册表对外暴露的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TerminusError {
    /// 规划网关输出无法归一化为有序步骤序列
    #[error("Planning failed: {0}")]
    Planning(String),

    /// 翻译网关输出无法归一化为单行非空命令
    #[error("Translation failed: {0}")]
    Translation(String),

    #[error("Command timed out after {}s", .0.as_secs_f64())]
    ExecutionTimeout(Duration),

    /// 命令未能启动或等待失败（非零退出码不在此列）
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// 沙箱执行身份不可用（环境配置问题，不重试）
    #[error("Sandbox principal unavailable: {0}")]
    Privilege(String),

    #[error("Re-planning budget exceeded after {failures} consecutive failures")]
    ReplanBudgetExceeded { failures: u32 },

    #[error("Session {0} already has an active workflow")]
    SessionActive(String),

    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Invalid goal: {0}")]
    InvalidGoal(String),

    #[error("Workflow aborted")]
    Aborted,
}

impl TerminusError {
    /// 面向用户的错误文本前缀，如 `[planner] ...`
    pub fn category(&self) -> &'static str {
        match self {
            TerminusError::Planning(_) => "planner",
            TerminusError::Translation(_) => "translator",
            TerminusError::ExecutionTimeout(_) => "timeout",
            TerminusError::ExecutionFailed(_) => "sandbox",
            TerminusError::Privilege(_) => "privilege",
            TerminusError::ReplanBudgetExceeded { .. } => "budget",
            TerminusError::SessionActive(_) => "busy",
            TerminusError::SessionNotFound(_) | TerminusError::InvalidGoal(_) => "validation",
            TerminusError::Aborted => "cancelled",
        }
    }

    /// 致命错误：会话立即终止，不再调用任何网关
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            TerminusError::Translation(_)
                | TerminusError::ExecutionTimeout(_)
                | TerminusError::ExecutionFailed(_)
        )
    }

    /// `[category] message` 形式的用户可见文本
    pub fn tagged(&self) -> String {
        tag(self.category(), &self.to_string())
    }
}

/// 用分类前缀包装消息
pub fn tag(category: &str, message: &str) -> String {
    format!("[{category}] {message}")
}

impl From<SandboxError> for TerminusError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout { after, .. } => TerminusError::ExecutionTimeout(after),
            SandboxError::Privilege(msg) => TerminusError::Privilege(msg),
            SandboxError::Cancelled => TerminusError::Aborted,
            SandboxError::Spawn(msg) => TerminusError::ExecutionFailed(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_level_errors_are_recoverable() {
        assert!(!TerminusError::Translation("empty".into()).is_fatal());
        assert!(!TerminusError::ExecutionTimeout(Duration::from_secs(1)).is_fatal());
        assert!(!TerminusError::ExecutionFailed("spawn".into()).is_fatal());
    }

    #[test]
    fn test_session_level_errors_are_fatal() {
        assert!(TerminusError::Planning("no steps".into()).is_fatal());
        assert!(TerminusError::Privilege("no sudo".into()).is_fatal());
        assert!(TerminusError::ReplanBudgetExceeded { failures: 4 }.is_fatal());
        assert!(TerminusError::Aborted.is_fatal());
    }

    #[test]
    fn test_tagged_message() {
        let err = TerminusError::Planning("empty plan".into());
        assert_eq!(err.tagged(), "[planner] Planning failed: empty plan");
        assert_eq!(
            TerminusError::ExecutionTimeout(Duration::from_millis(1500)).to_string(),
            "Command timed out after 1.5s"
        );
    }

    #[test]
    fn test_sandbox_error_mapping() {
        let err: TerminusError = SandboxError::Privilege("user missing".into()).into();
        assert!(matches!(err, TerminusError::Privilege(_)));
        let err: TerminusError = SandboxError::Cancelled.into();
        assert_eq!(err, TerminusError::Aborted);
    }
}
