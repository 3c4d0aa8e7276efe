//! Hub：WebSocket 监听、连接处理与终态会话清理
//!
//! 每个连接分配一个新会话 ID；新的 execute_goal 会先中止该连接仍在运行的工作流，
//! 等它的事件全部转发完毕后再做限流判断与提交。连接断开时中止其会话。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::config::ServerSection;
use crate::core::{new_session_id, tag, SessionId, SessionRegistry, TerminusError};
use crate::events::EventStream;
use crate::observability::Readiness;
use crate::server::http::{self, HttpState};
use crate::server::message::{error_frame, ClientFrame, ServerFrame};

pub struct Hub {
    config: ServerSection,
    registry: Arc<SessionRegistry>,
    readiness: Arc<Readiness>,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(config: ServerSection, registry: Arc<SessionRegistry>, readiness: Readiness) -> Self {
        Self {
            config,
            registry,
            readiness: Arc::new(readiness),
            shutdown: CancellationToken::new(),
        }
    }

    /// 触发后 run 停止接受连接并中止全部会话
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 监听直到关闭信号
    pub async fn run(&self) -> Result<(), String> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| format!("Invalid bind address: {}", e))?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind: {}", e))?;
        tracing::info!("Terminus listening on ws://{}", addr);

        let http_state = HttpState::new(Arc::clone(&self.readiness), Arc::clone(&self.registry));
        let http_addr = self.config.http_addr.clone();
        let http_shutdown = self.shutdown.clone();
        let http_task = tokio::spawn(async move {
            if let Err(e) = http::serve(&http_addr, http_state, http_shutdown).await {
                tracing::error!("HTTP server error: {}", e);
            }
        });

        let mut sweep = tokio::time::interval(Duration::from_secs(
            self.config.sweep_interval_secs.max(1),
        ));
        let min_interval = Duration::from_millis(self.config.min_submit_interval_ms);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    self.registry.evict_terminal().await;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let registry = Arc::clone(&self.registry);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, registry, min_interval).await {
                                tracing::error!("Connection error from {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
            }
        }

        tracing::info!("Shutting down, aborting {} active sessions", self.registry.active_count().await);
        self.registry.shutdown().await;
        let _ = http_task.await;
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<SessionRegistry>,
    min_interval: Duration,
) -> Result<(), String> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| format!("WebSocket handshake failed: {}", e))?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection::new(new_session_id(), registry, tx, min_interval);
    tracing::info!(session_id = %conn.session_id, %peer, "client connected");
    let connected = ServerFrame::Status {
        message: "connected".to_string(),
        session_id: conn.session_id.clone(),
    };
    conn.send(serde_json::to_string(&connected).unwrap_or_default());

    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("WebSocket receive error: {}", e);
                break;
            }
        };
        let text = match msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        match ClientFrame::parse(&text) {
            Ok(ClientFrame::ExecuteGoal { goal }) => conn.execute_goal(&goal).await,
            Ok(ClientFrame::Reset) => conn.reset().await,
            Ok(ClientFrame::Ping) => {
                conn.send(serde_json::to_string(&ServerFrame::Pong {}).unwrap_or_default());
            }
            Err(message) => conn.send(error_frame(message, "parse")),
        }
    }

    conn.close().await;
    tracing::info!(%peer, "client disconnected");
    Ok(())
}

/// 单个连接的会话状态：会话 ID、出站队列、限流时间戳与当前事件转发任务
struct Connection {
    session_id: SessionId,
    registry: Arc<SessionRegistry>,
    tx: mpsc::UnboundedSender<String>,
    min_interval: Duration,
    last_submit: Option<Instant>,
    forwarder: Option<JoinHandle<()>>,
}

impl Connection {
    fn new(
        session_id: SessionId,
        registry: Arc<SessionRegistry>,
        tx: mpsc::UnboundedSender<String>,
        min_interval: Duration,
    ) -> Self {
        Self {
            session_id,
            registry,
            tx,
            min_interval,
            last_submit: None,
            forwarder: None,
        }
    }

    fn send(&self, frame: String) {
        let _ = self.tx.send(frame);
    }

    /// 中止上一个工作流并等待其事件转发完毕，然后限流、提交
    async fn execute_goal(&mut self, goal: &str) {
        self.stop_previous().await;

        if self
            .last_submit
            .is_some_and(|t| t.elapsed() < self.min_interval)
        {
            tracing::warn!(session_id = %self.session_id, "submit rate limited");
            self.send(error_frame(
                tag("rate_limit", "too many requests, slow down"),
                "submit",
            ));
            return;
        }
        self.last_submit = Some(Instant::now());

        match self
            .registry
            .submit(Some(self.session_id.clone()), goal)
            .await
        {
            Ok(handle) => {
                self.forwarder = Some(tokio::spawn(forward(handle.events, self.tx.clone())));
            }
            Err(e) => self.send(error_frame(e.tagged(), "submit")),
        }
    }

    async fn reset(&mut self) {
        match self.registry.abort(&self.session_id).await {
            Ok(()) | Err(TerminusError::SessionNotFound(_)) => {}
            Err(e) => self.send(error_frame(e.tagged(), "reset")),
        }
    }

    /// 运行中的工作流先中止再等待终态；终态事件由转发任务送出后该任务结束
    async fn stop_previous(&mut self) {
        if self
            .registry
            .status(&self.session_id)
            .await
            .is_some_and(|s| !s.status.is_terminal())
        {
            tracing::info!(session_id = %self.session_id, "aborting previous workflow");
            let _ = self.registry.abort(&self.session_id).await;
            let _ = self.registry.wait(&self.session_id).await;
        }
        if let Some(forwarder) = self.forwarder.take() {
            if let Err(e) = forwarder.await {
                tracing::warn!(session_id = %self.session_id, error = %e, "event forwarder failed");
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.registry.abort(&self.session_id).await;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

/// 把会话事件转发给连接，发出终态事件后结束
async fn forward(mut events: EventStream, tx: mpsc::UnboundedSender<String>) {
    while let Some(event) = events.recv().await {
        let terminal = event.event.is_terminal();
        let json = serde_json::to_string(&event).unwrap_or_default();
        if tx.send(json).is_err() || terminal {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Collaborators, EnginePolicy, SessionStatus};
    use crate::gateway::{FakePlanner, FakeTranslator};
    use crate::sandbox::{CommandExecutor, ExecOutput, SandboxError};
    use async_trait::async_trait;
    use serde_json::Value;

    /// `echo hello` 阻塞直到取消，其余命令立即成功
    struct HoldingExecutor;

    #[async_trait]
    impl CommandExecutor for HoldingExecutor {
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
            Ok(ExecOutput {
                stdout: format!("{command}\n"),
                stderr: String::new(),
                exit_code: 0,
                duration_ms: 0,
            })
        }
    }

    fn connection(min_interval: Duration) -> (Connection, mpsc::UnboundedReceiver<String>) {
        let registry = Arc::new(SessionRegistry::new(
            Collaborators {
                planner: Arc::new(FakePlanner),
                translator: Arc::new(FakeTranslator),
                executor: Arc::new(HoldingExecutor),
            },
            EnginePolicy::default(),
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        (Connection::new("conn01".into(), registry, tx, min_interval), rx)
    }

    /// 等到会话的步骤进入执行
    async fn until_executing(conn: &Connection) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !conn
                .registry
                .status(&conn.session_id)
                .await
                .is_some_and(|s| s.executing_steps == 1)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_previous_stream_is_flushed_before_next_submit() {
        let (mut conn, mut rx) = connection(Duration::ZERO);
        conn.execute_goal("print hello").await;
        until_executing(&conn).await;
        conn.execute_goal("list files").await;
        conn.registry.wait("conn01").await.unwrap();
        if let Some(forwarder) = conn.forwarder.take() {
            forwarder.await.unwrap();
        }

        let frames = drain(&mut rx);
        let kinds: Vec<&str> = frames.iter().filter_map(|f| f["type"].as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "plan_generated",
                "step_executing",
                "error_detected",
                "workflow_complete",
                "plan_generated",
                "step_executing",
                "step_result",
                "workflow_complete",
            ]
        );
        // 每个工作流的序号各自从 0 开始且连续
        let seqs: Vec<u64> = frames.iter().filter_map(|f| f["seq"].as_u64()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 0, 1, 2, 3]);
        assert_eq!(frames[2]["payload"]["error"], "[cancelled] workflow aborted");
    }

    #[tokio::test]
    async fn test_rate_limited_submit_still_aborts_running_workflow() {
        let (mut conn, mut rx) = connection(Duration::from_secs(60));
        conn.execute_goal("print hello").await;
        until_executing(&conn).await;
        conn.execute_goal("list files").await;

        let snap = conn.registry.status("conn01").await.unwrap();
        assert_eq!(snap.status, SessionStatus::Aborted);

        let frames = drain(&mut rx);
        let last = frames.last().unwrap();
        assert_eq!(last["type"], "error_detected");
        assert_eq!(last["payload"]["failed_step"], "submit");
        assert!(last["payload"]["error"]
            .as_str()
            .unwrap()
            .starts_with("[rate_limit]"));
        // 被中止的工作流的终态事件先于限流错误送达
        assert_eq!(frames[frames.len() - 2]["type"], "workflow_complete");
    }

    #[tokio::test]
    async fn test_close_aborts_session() {
        let (mut conn, _rx) = connection(Duration::ZERO);
        conn.execute_goal("print hello").await;
        conn.close().await;
        let snap = conn.registry.wait("conn01").await.unwrap();
        assert_eq!(snap.status, SessionStatus::Aborted);
    }
}
