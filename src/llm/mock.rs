//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按顺序返回预置回复；脚本耗尽后回显最后一条 User 消息。记录调用次数与收到的会话标签。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    tags: Mutex<Vec<String>>,
    last_messages: Mutex<Vec<Message>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(replies: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    /// 已收到的调用次数
    pub fn calls(&self) -> usize {
        self.tags.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// 每次调用携带的会话标签
    pub fn tags(&self) -> Vec<String> {
        self.tags.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// 最近一次调用的消息
    pub fn last_messages(&self) -> Vec<Message> {
        self.last_messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message], tag: &str) -> Result<String, LlmError> {
        if let Ok(mut tags) = self.tags.lock() {
            tags.push(tag.to_string());
        }
        if let Ok(mut last) = self.last_messages.lock() {
            *last = messages.to_vec();
        }
        if let Some(reply) = self.script.lock().ok().and_then(|mut s| s.pop_front()) {
            return reply;
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        Ok(format!("Echo from Mock: {last_user}"))
    }

    fn model(&self) -> &str {
        "mock"
    }
}
