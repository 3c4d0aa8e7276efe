//! 确定性的离线网关（无 API key 或 `llm.fake = true` 时使用）
//!
//! 规划器按 `->` 拆分目标；翻译器按关键词映射到固定命令；
//! 重规划把失败步骤替换为 `remediate: <step>` 并保留未尝试的尾部。

use async_trait::async_trait;

use crate::core::StepRecord;
use crate::gateway::{
    FailureDetail, GatewayContext, GatewayError, PlanningGateway, RawPlan, TranslationGateway,
};

#[derive(Debug, Default)]
pub struct FakePlanner;

impl FakePlanner {
    fn split_goal(goal: &str) -> Vec<String> {
        goal.split("->")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

#[async_trait]
impl PlanningGateway for FakePlanner {
    async fn create_plan(&self, _ctx: &GatewayContext, goal: &str) -> Result<RawPlan, GatewayError> {
        Ok(RawPlan::Steps(Self::split_goal(goal)))
    }

    async fn revise_plan(
        &self,
        _ctx: &GatewayContext,
        goal: &str,
        _history: &[StepRecord],
        failure: &FailureDetail,
    ) -> Result<RawPlan, GatewayError> {
        let steps = Self::split_goal(goal);
        let tail = match steps.iter().position(|s| *s == failure.step) {
            Some(i) => steps[i + 1..].to_vec(),
            None => Vec::new(),
        };
        let mut plan = vec![format!("remediate: {}", failure.step)];
        plan.extend(tail);
        Ok(RawPlan::Steps(plan))
    }
}

#[derive(Debug, Default)]
pub struct FakeTranslator;

#[async_trait]
impl TranslationGateway for FakeTranslator {
    async fn translate(&self, _ctx: &GatewayContext, step: &str) -> Result<String, GatewayError> {
        let lower = step.to_lowercase();
        let command = if lower.starts_with("remediate") {
            "echo remediate"
        } else if lower.contains("print hello") {
            "echo hello"
        } else if lower.contains("print done") || lower.contains("print completion") {
            "echo done"
        } else if lower.contains("cause failure") {
            "exit 1"
        } else {
            "echo noop"
        };
        Ok(command.to_string())
    }
}
