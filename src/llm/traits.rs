//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 LlmClient::complete（非流式）。
//! tag 为会话标签，由后端随请求一并发送（OpenAI 的 `user` 字段）。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("Rate limited")]
    RateLimited,

    #[error("LLM request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("LLM API error: {0}")]
    Api(String),

    #[error("Empty completion")]
    EmptyResponse,
}

impl LlmError {
    /// 可重试的瞬时错误（无效请求重试无意义）
    pub fn is_transient(&self) -> bool {
        !matches!(self, LlmError::InvalidRequest(_))
    }

    /// 从后端错误文本归类
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("rate limit") || lower.contains("429") {
            LlmError::RateLimited
        } else if lower.contains("invalid_request") || lower.contains("invalid argument") {
            LlmError::InvalidRequest(message)
        } else {
            LlmError::Api(message)
        }
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, messages: &[Message], tag: &str) -> Result<String, LlmError>;

    /// 模型名（用于日志）
    fn model(&self) -> &str {
        "unknown"
    }
}

/// 重试策略：失败后最多再试 retries 次，第 i 次重试前等待 backoff * 2^i
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub retries: u32,
    pub backoff: Duration,
}

impl RetryConfig {
    pub fn new(retries: u32, backoff_ms: u64) -> Self {
        Self {
            retries,
            backoff: Duration::from_millis(backoff_ms),
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(2, 750)
    }
}

/// 带指数退避重试的客户端包装
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message], tag: &str) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(messages, tag).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < self.config.retries => {
                    let delay = self.config.delay(attempt);
                    tracing::warn!(
                        model = self.inner.model(),
                        attempt = attempt + 1,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "llm call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}
