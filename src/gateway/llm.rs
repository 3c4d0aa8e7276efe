//! LLM 支撑的规划器与翻译器
//!
//! 规划器返回 RawPlan::Text，由核心归一化；翻译器对白名单首词的步骤直接透传原文，
//! 其余交给模型生成单行命令。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::core::StepRecord;
use crate::gateway::{
    FailureDetail, GatewayContext, GatewayError, PlanningGateway, RawPlan, TranslationGateway,
};
use crate::llm::{LlmClient, Message};

const PLANNER_SYSTEM_PROMPT: &str = "You are an expert DevOps and systems engineer Planner.\n\
Task: Decompose the user's goal into a minimal, correct step-by-step plan.\n\
Output STRICT JSON with a single key \"plan\": a JSON array of short, imperative steps.\n\
Do not include explanations, only the JSON object.";

const TRANSLATOR_SYSTEM_PROMPT: &str = "You are a Translator. Output only one valid single-line bash command for the sub-task.\n\
No explanations, no comments, no multi-line, no prompts for confirmation.";

/// 重规划提示：附带截断后的上下文 JSON
pub fn revision_prompt(
    goal: &str,
    history: &[StepRecord],
    failure: &FailureDetail,
    max_context_chars: usize,
) -> String {
    let context = json!({
        "original_goal": goal,
        "failed_step": failure.step,
        "command": failure.command,
        "error": failure.error,
        "exit_code": failure.exit_code,
        "stderr": failure.stderr,
        "history": history,
    })
    .to_string();
    let context: String = context.chars().take(max_context_chars).collect();

    format!(
        "Re-plan to complete the objective after encountering an error.\n\
         Constraints:\n\
         - Keep steps minimal and imperative\n\
         - Include any necessary remediation or prerequisites discovered from the error\n\
         - Avoid repeating already successful steps unless needed as prerequisites\n\n\
         Context JSON:\n{context}"
    )
}

pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    max_context_chars: usize,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, max_context_chars: usize) -> Self {
        Self {
            llm,
            max_context_chars,
        }
    }

    async fn ask(&self, ctx: &GatewayContext, user: String) -> Result<RawPlan, GatewayError> {
        let messages = [Message::system(PLANNER_SYSTEM_PROMPT), Message::user(user)];
        let text = self.llm.complete(&messages, &ctx.tag).await?;
        tracing::debug!(session_id = %ctx.session_id, model = self.llm.model(), "planner replied");
        Ok(RawPlan::Text(text))
    }
}

#[async_trait]
impl PlanningGateway for LlmPlanner {
    async fn create_plan(&self, ctx: &GatewayContext, goal: &str) -> Result<RawPlan, GatewayError> {
        self.ask(ctx, goal.to_string()).await
    }

    async fn revise_plan(
        &self,
        ctx: &GatewayContext,
        goal: &str,
        history: &[StepRecord],
        failure: &FailureDetail,
    ) -> Result<RawPlan, GatewayError> {
        self.ask(ctx, revision_prompt(goal, history, failure, self.max_context_chars))
            .await
    }
}

pub struct LlmTranslator {
    llm: Arc<dyn LlmClient>,
    passthrough: HashSet<String>,
}

impl LlmTranslator {
    pub fn new(llm: Arc<dyn LlmClient>, passthrough_prefixes: &[String]) -> Self {
        Self {
            llm,
            passthrough: passthrough_prefixes
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
        }
    }

    /// 步骤本身已是命令（首词在透传列表中）
    fn is_passthrough(&self, step: &str) -> bool {
        step.split_whitespace()
            .next()
            .is_some_and(|first| self.passthrough.contains(&first.to_lowercase()))
    }
}

#[async_trait]
impl TranslationGateway for LlmTranslator {
    async fn translate(&self, ctx: &GatewayContext, step: &str) -> Result<String, GatewayError> {
        if self.is_passthrough(step) {
            tracing::debug!(session_id = %ctx.session_id, "step passed through verbatim");
            return Ok(step.trim().to_string());
        }
        let messages = [Message::system(TRANSLATOR_SYSTEM_PROMPT), Message::user(step)];
        Ok(self.llm.complete(&messages, &ctx.tag).await?)
    }
}
