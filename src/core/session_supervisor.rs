//! 会话监管：生命周期、中断管理
//!
//! 持有会话的 CancellationToken；abort 时触发，引擎丢弃进行中的网关调用，执行器终止进程组。

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// 会话级生命周期管理：取消令牌与中止原因
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    /// 是否已请求中止
    abort_requested: AtomicBool,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 请求中止；返回 true 表示本次调用首次触发
    pub fn abort(&self) -> bool {
        let first = !self.abort_requested.swap(true, Ordering::SeqCst);
        self.cancel_token.cancel();
        first
    }
}
