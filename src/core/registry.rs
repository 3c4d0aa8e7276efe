//! Session Registry：会话 ID → 会话引擎
//!
//! 同一 ID 至多一个非终态引擎；终态会话可被清理。映射由 RwLock 保护，
//! 每个条目持有自己的监管器、快照接收端与任务句柄。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::core::{
    new_session_id, Collaborators, EnginePolicy, Session, SessionEngine, SessionId,
    SessionOutcome, SessionSnapshot, SessionSupervisor, TerminusError,
};
use crate::events::{EventBus, EventStream};
use crate::observability::metrics;

const DEFAULT_MAX_GOAL_LEN: usize = 2000;

struct SessionEntry {
    supervisor: SessionSupervisor,
    snapshot: watch::Receiver<SessionSnapshot>,
    handle: Mutex<Option<JoinHandle<SessionOutcome>>>,
}

impl SessionEntry {
    fn is_terminal(&self) -> bool {
        self.snapshot.borrow().status.is_terminal()
    }
}

/// 提交成功后返回：会话 ID 与从第一个事件开始的事件流
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub events: EventStream,
}

pub struct SessionRegistry {
    entries: RwLock<HashMap<SessionId, Arc<SessionEntry>>>,
    bus: EventBus,
    deps: Collaborators,
    policy: EnginePolicy,
    max_goal_len: usize,
}

impl SessionRegistry {
    pub fn new(deps: Collaborators, policy: EnginePolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            bus: EventBus::new(),
            deps,
            policy,
            max_goal_len: DEFAULT_MAX_GOAL_LEN,
        }
    }

    pub fn from_config(cfg: &AppConfig, deps: Collaborators) -> Self {
        Self::new(deps, EnginePolicy::from_config(cfg)).with_max_goal_len(cfg.session.max_goal_len)
    }

    pub fn with_max_goal_len(mut self, max_goal_len: usize) -> Self {
        self.max_goal_len = max_goal_len;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// 提交目标并启动引擎。
    ///
    /// 返回的事件流在引擎启动前订阅，不会错过任何事件。
    pub async fn submit(
        &self,
        session_id: Option<SessionId>,
        goal: &str,
    ) -> Result<SessionHandle, TerminusError> {
        metrics().execute_goal_requests.inc();
        let goal = validate_goal(goal, self.max_goal_len)?;
        let id = session_id.unwrap_or_else(new_session_id);

        let mut entries = self.entries.write().await;
        if entries.get(&id).is_some_and(|e| !e.is_terminal()) {
            tracing::warn!(session_id = %id, "session already active");
            return Err(TerminusError::SessionActive(id));
        }

        let supervisor = SessionSupervisor::new();
        let publisher = self.bus.open(&id);
        let events = self
            .bus
            .subscribe(&id)
            .ok_or_else(|| TerminusError::SessionNotFound(id.clone()))?;

        let engine = SessionEngine::new(
            Session::new(id.clone(), goal),
            self.deps.clone(),
            publisher,
            self.policy.clone(),
            supervisor.cancel_token(),
        );
        let snapshot = engine.snapshots();
        let handle = tokio::spawn(engine.run());

        entries.insert(
            id.clone(),
            Arc::new(SessionEntry {
                supervisor,
                snapshot,
                handle: Mutex::new(Some(handle)),
            }),
        );
        tracing::info!(session_id = %id, active = entries.len(), "session_submitted");

        Ok(SessionHandle {
            session_id: id,
            events,
        })
    }

    async fn entry(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.entries.read().await.get(session_id).cloned()
    }

    /// 中止会话；已是终态时不做任何事
    pub async fn abort(&self, session_id: &str) -> Result<(), TerminusError> {
        let entry = self
            .entry(session_id)
            .await
            .ok_or_else(|| TerminusError::SessionNotFound(session_id.to_string()))?;
        if !entry.is_terminal() && entry.supervisor.abort() {
            tracing::info!(session_id, "abort requested");
        }
        Ok(())
    }

    pub async fn status(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.entry(session_id)
            .await
            .map(|e| e.snapshot.borrow().clone())
    }

    /// 晚到的订阅：只收到订阅之后的事件
    pub async fn subscribe(&self, session_id: &str) -> Option<EventStream> {
        self.entry(session_id).await?;
        self.bus.subscribe(session_id)
    }

    /// 等待会话进入终态，返回最终快照
    pub async fn wait(&self, session_id: &str) -> Result<SessionSnapshot, TerminusError> {
        let entry = self
            .entry(session_id)
            .await
            .ok_or_else(|| TerminusError::SessionNotFound(session_id.to_string()))?;
        let mut rx = entry.snapshot.clone();
        let snapshot = match rx.wait_for(|s| s.status.is_terminal()).await {
            Ok(snap) => snap.clone(),
            // 引擎任务异常退出：返回最后已知状态
            Err(_) => entry.snapshot.borrow().clone(),
        };
        Ok(snapshot)
    }

    /// 清理终态会话，返回清理数量
    pub async fn evict_terminal(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_terminal());
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::info!(evicted, remaining = entries.len(), "evicted terminal sessions");
        }
        evicted
    }

    /// 非终态会话数
    pub async fn active_count(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| !e.is_terminal())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 中止全部会话并等待引擎任务结束
    pub async fn shutdown(&self) {
        let entries: Vec<(SessionId, Arc<SessionEntry>)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), Arc::clone(e)))
            .collect();

        for (_, entry) in &entries {
            if !entry.is_terminal() {
                entry.supervisor.abort();
            }
        }
        for (id, entry) in entries {
            if let Some(handle) = entry.handle.lock().await.take() {
                if let Err(e) = handle.await {
                    tracing::error!(session_id = %id, error = %e, "engine task failed");
                }
            }
        }
        tracing::info!("session registry shut down");
    }
}

/// 目标校验：去除首尾空白，非空且不超过长度上限（按字符计）
pub fn validate_goal(goal: &str, max_len: usize) -> Result<String, TerminusError> {
    let goal = goal.trim();
    if goal.is_empty() {
        return Err(TerminusError::InvalidGoal("goal is empty".to_string()));
    }
    let len = goal.chars().count();
    if len > max_len {
        return Err(TerminusError::InvalidGoal(format!(
            "goal is {len} characters, limit is {max_len}"
        )));
    }
    Ok(goal.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SessionStatus;
    use crate::gateway::{FakePlanner, FakeTranslator};
    use crate::sandbox::{CommandExecutor, ExecOutput, SandboxError};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// `echo hello` 阻塞直到取消；`exit N` 返回 N；其余返回 0
    struct BlockingExecutor;

    #[async_trait]
    impl CommandExecutor for BlockingExecutor {
        async fn run(
            &self,
            command: &str,
            _timeout: Duration,
            cancel: CancellationToken,
        ) -> Result<ExecOutput, SandboxError> {
            if command == "echo hello" {
                cancel.cancelled().await;
                return Err(SandboxError::Cancelled);
            }
            let exit_code = command
                .strip_prefix("exit ")
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code,
                duration_ms: 0,
            })
        }
    }

    fn registry() -> SessionRegistry {
        SessionRegistry::new(
            Collaborators {
                planner: Arc::new(FakePlanner),
                translator: Arc::new(FakeTranslator),
                executor: Arc::new(BlockingExecutor),
            },
            EnginePolicy::default(),
        )
        .with_max_goal_len(20)
    }

    #[test]
    fn test_validate_goal() {
        assert_eq!(validate_goal("  list files ", 20).unwrap(), "list files");
        assert!(matches!(validate_goal("   ", 20), Err(TerminusError::InvalidGoal(_))));
        assert!(matches!(
            validate_goal(&"x".repeat(21), 20),
            Err(TerminusError::InvalidGoal(_))
        ));
    }

    #[tokio::test]
    async fn test_at_most_one_active_engine_per_id() {
        let reg = registry();
        let handle = reg.submit(Some("dup".into()), "print hello").await.unwrap();
        assert_eq!(handle.session_id, "dup");
        let err = reg.submit(Some("dup".into()), "print hello").await.unwrap_err();
        assert_eq!(err, TerminusError::SessionActive("dup".into()));
        assert_eq!(reg.active_count().await, 1);

        reg.abort("dup").await.unwrap();
        let snap = reg.wait("dup").await.unwrap();
        assert_eq!(snap.status, SessionStatus::Aborted);

        // 终态后可以复用同一 ID
        assert!(reg.submit(Some("dup".into()), "print hello").await.is_ok());
        reg.shutdown().await;
    }

    #[tokio::test]
    async fn test_evict_terminal_and_unknown_ids() {
        let reg = registry();
        reg.submit(Some("a".into()), "cause failure").await.unwrap();
        reg.wait("a").await.unwrap();
        assert_eq!(reg.active_count().await, 0);
        assert_eq!(reg.evict_terminal().await, 1);
        assert!(reg.is_empty().await);

        assert!(reg.status("a").await.is_none());
        assert!(matches!(
            reg.abort("a").await,
            Err(TerminusError::SessionNotFound(_))
        ));
        assert!(reg.subscribe("a").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_goal_creates_nothing() {
        let reg = registry();
        assert!(matches!(
            reg.submit(None, "").await,
            Err(TerminusError::InvalidGoal(_))
        ));
        assert!(reg.is_empty().await);
        assert_eq!(reg.bus().topic_count(), 0);
    }
}
