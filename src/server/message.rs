//! WebSocket 帧格式
//!
//! 入站：`{"type": "execute_goal", "payload": {"goal": "..."}}`、`{"type": "reset"}`、`{"type": "ping"}`。
//! 出站：会话事件（SessionEvent）、`status`、`pong`，以及无会话上下文的 `error_detected`。

use serde::{Deserialize, Serialize};

use crate::core::tag;
use crate::events::Event;

/// 客户端发来的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    ExecuteGoal { goal: String },
    Reset,
    Ping,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

impl ClientFrame {
    /// 解析入站文本；错误信息已带 `[validation]` 前缀
    pub fn parse(text: &str) -> Result<Self, String> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|e| tag("validation", &format!("malformed frame: {e}")))?;
        match raw.kind.as_str() {
            "execute_goal" => raw
                .payload
                .get("goal")
                .and_then(|g| g.as_str())
                .map(|goal| ClientFrame::ExecuteGoal {
                    goal: goal.to_string(),
                })
                .ok_or_else(|| tag("validation", "execute_goal requires payload.goal")),
            "reset" => Ok(ClientFrame::Reset),
            "ping" => Ok(ClientFrame::Ping),
            other => Err(tag("validation", &format!("unknown frame type '{other}'"))),
        }
    }
}

/// 服务端控制帧
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Status { message: String, session_id: String },
    Pong {},
}

/// 连接级错误（不属于任何工作流的事件序列）
pub fn error_frame(error: String, failed_step: &str) -> String {
    serde_json::to_string(&Event::ErrorDetected {
        error,
        failed_step: failed_step.to_string(),
    })
    .unwrap_or_default()
}
