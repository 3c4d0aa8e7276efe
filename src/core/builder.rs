//! 引擎构建器：统一的组件初始化逻辑
//!
//! CLI 与 WebSocket 服务共用同一套网关与执行器选择；测试可逐项替换。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{Collaborators, SessionRegistry};
use crate::gateway::{
    FakePlanner, FakeTranslator, LlmPlanner, LlmTranslator, PlanningGateway, TranslationGateway,
};
use crate::llm::{LlmClient, OpenAiClient, RetryConfig, RetryingLlmClient};
use crate::sandbox::{CommandExecutor, ShellSandbox};

/// 引擎构建器：按配置装配规划器、翻译器与沙箱执行器
pub struct EngineBuilder {
    config: AppConfig,
    planner: Option<Arc<dyn PlanningGateway>>,
    translator: Option<Arc<dyn TranslationGateway>>,
    executor: Option<Arc<dyn CommandExecutor>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            planner: None,
            translator: None,
            executor: None,
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn PlanningGateway>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_translator(mut self, translator: Arc<dyn TranslationGateway>) -> Self {
        self.translator = Some(translator);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// 显式配置 fake，或没有 OPENAI_API_KEY 时使用离线网关
    pub fn uses_fake_gateways(&self) -> bool {
        self.config.llm.fake || std::env::var("OPENAI_API_KEY").map_or(true, |k| k.is_empty())
    }

    /// 构建带重试的 LLM 客户端
    pub fn build_llm(&self, model: &str) -> Arc<dyn LlmClient> {
        let llm = &self.config.llm;
        let client = OpenAiClient::new(
            llm.base_url.as_deref(),
            model,
            None,
            Duration::from_secs(llm.request_timeout_secs),
        );
        Arc::new(RetryingLlmClient::new(
            Arc::new(client),
            RetryConfig::new(llm.retries, llm.backoff_ms),
        ))
    }

    pub fn build_planner(&self) -> Arc<dyn PlanningGateway> {
        if let Some(planner) = &self.planner {
            return Arc::clone(planner);
        }
        if self.uses_fake_gateways() {
            tracing::warn!("No API key set or llm.fake enabled, using fake planner");
            return Arc::new(FakePlanner);
        }
        tracing::info!("Using LLM planner ({})", self.config.llm.planner_model);
        Arc::new(LlmPlanner::new(
            self.build_llm(&self.config.llm.planner_model),
            self.config.session.history_context_chars,
        ))
    }

    pub fn build_translator(&self) -> Arc<dyn TranslationGateway> {
        if let Some(translator) = &self.translator {
            return Arc::clone(translator);
        }
        if self.uses_fake_gateways() {
            tracing::warn!("No API key set or llm.fake enabled, using fake translator");
            return Arc::new(FakeTranslator);
        }
        tracing::info!("Using LLM translator ({})", self.config.llm.translator_model);
        Arc::new(LlmTranslator::new(
            self.build_llm(&self.config.llm.translator_model),
            &self.config.llm.passthrough_prefixes,
        ))
    }

    pub fn build_executor(&self) -> Arc<dyn CommandExecutor> {
        match &self.executor {
            Some(executor) => Arc::clone(executor),
            None => Arc::new(ShellSandbox::from_config(&self.config.sandbox)),
        }
    }

    pub fn build_collaborators(&self) -> Collaborators {
        Collaborators {
            planner: self.build_planner(),
            translator: self.build_translator(),
            executor: self.build_executor(),
        }
    }

    pub fn build_registry(&self) -> SessionRegistry {
        SessionRegistry::from_config(&self.config, self.build_collaborators())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }
}

/// 便捷函数：加载配置（失败时回退默认值）并创建构建器
pub fn create_engine_builder(config_path: Option<PathBuf>) -> EngineBuilder {
    let config = crate::config::load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    EngineBuilder::new(config)
}
