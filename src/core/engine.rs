//! Session Engine：单个会话的状态机
//!
//! Planning → Executing → {Executing | RePlanning} → … → Completed | Failed | Aborted。
//! 步骤级失败（翻译、执行）进入重规划；连续失败超过上限、初始规划失败、执行身份不可用时终止。
//! 每次迁移推送一个事件；所有终止路径恰好推送一个 workflow_complete。
//! 终态快照在终止事件推送之后才发布，等待终态的一方可以认为事件流已完整。
//! 取消令牌触发时，进行中的网关调用被丢弃，进行中的命令由执行器终止整个进程组。

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{tag, Session, SessionSnapshot, SessionStatus, StepStatus, TerminusError};
use crate::events::{CompletionStatus, Event, EventPublisher};
use crate::gateway::{
    normalize_command, normalize_plan, FailureDetail, GatewayContext, PlanningGateway,
    TranslationGateway,
};
use crate::observability::metrics;
use crate::sandbox::{
    preview, CommandExecutor, ExecOutput, SandboxError, EXIT_CODE_REJECTED, EXIT_CODE_TIMEOUT,
    EXIT_CODE_UNAVAILABLE,
};

/// 引擎策略参数
#[derive(Debug, Clone)]
pub struct EnginePolicy {
    /// 连续失败上限：第 max+1 次连续失败直接终止
    pub max_consecutive_failures: u32,
    pub command_timeout: Duration,
    pub max_plan_steps: usize,
    pub forbidden_prefixes: Vec<String>,
    /// 会话标签前缀
    pub safety_prefix: String,
}

impl EnginePolicy {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            max_consecutive_failures: cfg.session.max_consecutive_failures,
            command_timeout: cfg.sandbox.timeout(),
            max_plan_steps: cfg.session.max_plan_steps,
            forbidden_prefixes: cfg.llm.forbidden_prefixes.clone(),
            safety_prefix: cfg.llm.safety_prefix.clone(),
        }
    }
}

impl Default for EnginePolicy {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 引擎依赖的外部能力（多会话共享）
#[derive(Clone)]
pub struct Collaborators {
    pub planner: Arc<dyn PlanningGateway>,
    pub translator: Arc<dyn TranslationGateway>,
    pub executor: Arc<dyn CommandExecutor>,
}

/// 会话结束时的结果
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session: Session,
    pub result: Result<(), TerminusError>,
}

impl SessionOutcome {
    pub fn status(&self) -> SessionStatus {
        self.session.status
    }
}

pub struct SessionEngine {
    session: Session,
    deps: Collaborators,
    events: EventPublisher,
    policy: EnginePolicy,
    cancel: CancellationToken,
    snapshot: watch::Sender<SessionSnapshot>,
    ctx: GatewayContext,
}

impl SessionEngine {
    pub fn new(
        session: Session,
        deps: Collaborators,
        events: EventPublisher,
        policy: EnginePolicy,
        cancel: CancellationToken,
    ) -> Self {
        let ctx = GatewayContext::new(&session.id, &policy.safety_prefix);
        let (snapshot, _) = watch::channel(SessionSnapshot::from(&session));
        Self {
            session,
            deps,
            events,
            policy,
            cancel,
            snapshot,
            ctx,
        }
    }

    /// 会话快照（每次状态迁移后更新）
    pub fn snapshots(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// 驱动状态机直到终态
    pub async fn run(mut self) -> SessionOutcome {
        tracing::info!(session_id = %self.session.id, goal_len = self.session.goal.len(), "workflow_started");
        let result = self.drive().await;

        match &result {
            Ok(()) => {
                self.session.status = SessionStatus::Completed;
                tracing::info!(
                    session_id = %self.session.id,
                    steps = self.session.steps.len(),
                    "workflow_complete"
                );
                self.events.emit(Event::WorkflowComplete {
                    status: CompletionStatus::Success,
                });
            }
            Err(TerminusError::Aborted) => {
                if let Some(step) = self.session.current_step_mut() {
                    if step.status == StepStatus::Executing {
                        step.status = StepStatus::Failed;
                    }
                }
                self.session.status = SessionStatus::Aborted;
                tracing::info!(session_id = %self.session.id, "workflow_cancelled");
                let failed_step = self.failed_step_label("cancel");
                self.events.emit(Event::ErrorDetected {
                    error: tag("cancelled", "workflow aborted"),
                    failed_step,
                });
                self.events.emit(Event::WorkflowComplete {
                    status: CompletionStatus::Failed,
                });
            }
            Err(e) => {
                self.session.status = SessionStatus::Failed;
                tracing::warn!(session_id = %self.session.id, error = %e, "workflow_failed");
                self.events.emit(Event::WorkflowComplete {
                    status: CompletionStatus::Failed,
                });
            }
        }

        self.publish_snapshot();

        SessionOutcome {
            session: self.session,
            result,
        }
    }

    async fn drive(&mut self) -> Result<(), TerminusError> {
        self.plan().await?;

        while self.session.current < self.session.steps.len() {
            if self.cancel.is_cancelled() {
                return Err(TerminusError::Aborted);
            }
            match self.execute_current().await {
                Ok(()) => {
                    if let Some(step) = self.session.current_step_mut() {
                        step.status = StepStatus::Success;
                    }
                    self.session.consecutive_failures = 0;
                    self.session.current += 1;
                    self.publish_snapshot();
                }
                Err(TerminusError::Aborted) => return Err(TerminusError::Aborted),
                Err(err) => {
                    metrics().steps_failed.inc();
                    let failure = self.record_failure(&err);
                    if err.is_fatal() {
                        return Err(err);
                    }
                    self.session.consecutive_failures += 1;
                    self.publish_snapshot();
                    let failures = self.session.consecutive_failures;
                    if failures > self.policy.max_consecutive_failures {
                        tracing::warn!(
                            session_id = %self.session.id,
                            failures,
                            max = self.policy.max_consecutive_failures,
                            "replan_budget_exceeded"
                        );
                        return Err(TerminusError::ReplanBudgetExceeded { failures });
                    }
                    self.replan(failure).await?;
                }
            }
        }
        Ok(())
    }

    /// 初始规划
    async fn plan(&mut self) -> Result<(), TerminusError> {
        self.set_status(SessionStatus::Planning);
        let planner = Arc::clone(&self.deps.planner);
        let start = Instant::now();
        let raw = self
            .cancellable(planner.create_plan(&self.ctx, &self.session.goal))
            .await?
            .map_err(|e| TerminusError::Planning(e.to_string()));
        metrics().planner_latency.observe(start.elapsed());

        let steps = match raw.and_then(|raw| normalize_plan(raw, self.policy.max_plan_steps)) {
            Ok(steps) => steps,
            Err(err) => {
                tracing::error!(session_id = %self.session.id, error = %err, "planner_error");
                self.events.emit(Event::ErrorDetected {
                    error: err.tagged(),
                    failed_step: "planning".to_string(),
                });
                return Err(err);
            }
        };

        self.session.install_plan(steps);
        tracing::info!(session_id = %self.session.id, steps = self.session.steps.len(), "plan_generated");
        self.events.emit(Event::PlanGenerated {
            plan: self.session.plan_descriptions(),
        });
        self.set_status(SessionStatus::Executing);
        Ok(())
    }

    /// 翻译并执行当前步骤；成功返回 Ok，非零退出码等失败返回对应错误
    async fn execute_current(&mut self) -> Result<(), TerminusError> {
        let index = self.session.current;
        let description = match self.session.current_step_mut() {
            Some(step) => {
                step.status = StepStatus::Executing;
                step.attempts += 1;
                step.description.clone()
            }
            None => return Ok(()),
        };
        self.publish_snapshot();

        let command = match self.translate(&description).await {
            Ok(command) => command,
            Err(TerminusError::Aborted) => return Err(TerminusError::Aborted),
            Err(err) => {
                tracing::warn!(session_id = %self.session.id, step_index = index, error = %err, "translation_failed");
                self.events.emit(Event::StepExecuting {
                    step: description,
                    command: None,
                });
                self.finish_step(ExecOutput {
                    stdout: String::new(),
                    stderr: err.tagged(),
                    exit_code: EXIT_CODE_REJECTED,
                    duration_ms: 0,
                });
                return Err(err);
            }
        };

        if let Some(step) = self.session.current_step_mut() {
            step.command = Some(command.clone());
        }
        tracing::info!(
            session_id = %self.session.id,
            step_index = index,
            command = %preview(&command, 200),
            "step_executing"
        );
        self.events.emit(Event::StepExecuting {
            step: description,
            command: Some(command.clone()),
        });

        metrics().steps_executed.inc();
        let executor = Arc::clone(&self.deps.executor);
        let run = executor
            .run(&command, self.policy.command_timeout, self.cancel.clone())
            .await;

        match run {
            Ok(out) => {
                let exit_code = out.exit_code;
                let stderr = out.stderr.clone();
                let success = out.success();
                self.finish_step(out);
                if success {
                    return Ok(());
                }
                tracing::warn!(session_id = %self.session.id, step_index = index, exit_code, "step_failed");
                let reason = if stderr.trim().is_empty() {
                    format!("command exited with code {exit_code}")
                } else {
                    preview(stderr.trim(), 2000)
                };
                Err(TerminusError::ExecutionFailed(reason))
            }
            Err(SandboxError::Timeout {
                after,
                stdout,
                stderr,
            }) => {
                tracing::warn!(session_id = %self.session.id, step_index = index, timeout_ms = after.as_millis() as u64, "step_timeout");
                self.finish_step(ExecOutput {
                    stdout,
                    stderr,
                    exit_code: EXIT_CODE_TIMEOUT,
                    duration_ms: after.as_millis() as u64,
                });
                Err(TerminusError::ExecutionTimeout(after))
            }
            Err(SandboxError::Cancelled) => Err(TerminusError::Aborted),
            Err(err @ (SandboxError::Privilege(_) | SandboxError::Spawn(_))) => {
                tracing::error!(session_id = %self.session.id, step_index = index, error = %err, "sandbox_error");
                self.finish_step(ExecOutput {
                    stdout: String::new(),
                    stderr: err.to_string(),
                    exit_code: EXIT_CODE_UNAVAILABLE,
                    duration_ms: 0,
                });
                Err(err.into())
            }
        }
    }

    async fn translate(&self, description: &str) -> Result<String, TerminusError> {
        let translator = Arc::clone(&self.deps.translator);
        let start = Instant::now();
        let raw = self
            .cancellable(translator.translate(&self.ctx, description))
            .await?;
        metrics().executor_latency.observe(start.elapsed());
        let raw = raw.map_err(|e| TerminusError::Translation(e.to_string()))?;
        normalize_command(&raw, &self.policy.forbidden_prefixes)
    }

    /// 记录执行结果、追加尝试记录并推送 step_result
    fn finish_step(&mut self, out: ExecOutput) {
        self.events.emit(Event::StepResult {
            stdout: out.stdout.clone(),
            stderr: out.stderr.clone(),
            exit_code: out.exit_code,
        });
        if let Some(step) = self.session.current_step_mut() {
            step.stdout = out.stdout;
            step.stderr = out.stderr;
            step.exit_code = Some(out.exit_code);
        }
        self.session.record_attempt();
    }

    /// 标记当前步骤失败并推送 error_detected
    fn record_failure(&mut self, err: &TerminusError) -> FailureDetail {
        let error = err.tagged();
        let failure = match self.session.current_step_mut() {
            Some(step) => {
                step.status = StepStatus::Failed;
                FailureDetail {
                    step: step.description.clone(),
                    command: step.command.clone(),
                    error: error.clone(),
                    exit_code: step.exit_code,
                    stderr: step.stderr.clone(),
                }
            }
            None => FailureDetail {
                step: String::new(),
                command: None,
                error: error.clone(),
                exit_code: None,
                stderr: String::new(),
            },
        };
        self.events.emit(Event::ErrorDetected {
            error,
            failed_step: failure.step.clone(),
        });
        failure
    }

    /// 重规划：用修订计划替换当前索引及之后的步骤
    async fn replan(&mut self, failure: FailureDetail) -> Result<(), TerminusError> {
        self.set_status(SessionStatus::RePlanning);
        tracing::info!(
            session_id = %self.session.id,
            step_index = self.session.current,
            failures = self.session.consecutive_failures,
            "re_planning"
        );
        self.events.emit(Event::RePlanning {});

        let history = self.session.history();
        let planner = Arc::clone(&self.deps.planner);
        let start = Instant::now();
        let revised = self
            .cancellable(planner.revise_plan(&self.ctx, &self.session.goal, &history, &failure))
            .await?;
        metrics().planner_latency.observe(start.elapsed());
        let revised = revised
            .map_err(|e| TerminusError::Planning(e.to_string()))
            .and_then(|raw| normalize_plan(raw, self.policy.max_plan_steps));

        let steps = match revised {
            Ok(steps) => steps,
            Err(err) => {
                tracing::error!(session_id = %self.session.id, error = %err, "replanning_failed");
                self.events.emit(Event::ErrorDetected {
                    error: tag("planner", &format!("Re-planning failed: {err}")),
                    failed_step: failure.step,
                });
                return Err(err);
            }
        };

        self.session.splice_revision(steps);
        tracing::info!(
            session_id = %self.session.id,
            steps = self.session.steps.len(),
            "plan_generated"
        );
        self.events.emit(Event::PlanGenerated {
            plan: self.session.plan_descriptions(),
        });
        self.set_status(SessionStatus::Executing);
        Ok(())
    }

    /// 与取消令牌竞争；取消时丢弃进行中的调用
    async fn cancellable<T>(&self, fut: impl Future<Output = T>) -> Result<T, TerminusError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TerminusError::Aborted),
            out = fut => Ok(out),
        }
    }

    fn failed_step_label(&self, fallback: &str) -> String {
        self.session
            .current_step()
            .map(|s| s.description.clone())
            .unwrap_or_else(|| fallback.to_string())
    }

    fn set_status(&mut self, status: SessionStatus) {
        self.session.status = status;
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(SessionSnapshot::from(&self.session));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::observability::metrics;
use crate::gateway::{FakePlanner, FakeTranslator};
    use async_trait::async_trait;

    /// 不启动进程：`exit N` 返回退出码 N，其余返回 0
    struct EchoExecutor;

    #[async_trait]
    impl CommandExecutor for EchoExecutor {
        async fn run(
            &self,
            command: &str,
            _timeout: Duration,
            _cancel: CancellationToken,
        ) -> Result<ExecOutput, SandboxError> {
            let exit_code = command
                .strip_prefix("exit ")
                .and_then(|n| n.trim().parse().ok())
                .unwrap_or(0);
            Ok(ExecOutput {
                stdout: format!("{command}\n"),
                stderr: String::new(),
                exit_code,
                duration_ms: 1,
            })
        }
    }

    fn engine(goal: &str, bus: &EventBus) -> SessionEngine {
        let deps = Collaborators {
            planner: Arc::new(FakePlanner),
            translator: Arc::new(FakeTranslator),
            executor: Arc::new(EchoExecutor),
        };
        SessionEngine::new(
            Session::new("e1".into(), goal),
            deps,
            bus.open("e1"),
            EnginePolicy::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_fake_workflow_recovers_with_remediation() {
        let bus = EventBus::new();
        let engine = engine("print hello -> cause failure -> print done", &bus);
        let mut stream = bus.subscribe("e1").unwrap();
        let outcome = engine.run().await;

        assert_eq!(outcome.status(), SessionStatus::Completed);
        assert_eq!(
            outcome.session.plan_descriptions(),
            vec!["print hello", "remediate: cause failure", "print done"]
        );
        assert_eq!(outcome.session.retired.len(), 2);

        let kinds: Vec<&str> = stream
            .collect_until_terminal()
            .await
            .iter()
            .map(|e| e.event.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "plan_generated",
                "step_executing",
                "step_result",
                "step_executing",
                "step_result",
                "error_detected",
                "re_planning",
                "plan_generated",
                "step_executing",
                "step_result",
                "step_executing",
                "step_result",
                "workflow_complete",
            ]
        );
    }

    #[tokio::test]
    async fn test_terminal_snapshot_follows_terminal_event() {
        let bus = EventBus::new();
        let engine = engine("print hello", &bus);
        let mut snapshots = engine.snapshots();
        let mut stream = bus.subscribe("e1").unwrap();
        let handle = tokio::spawn(engine.run());

        snapshots
            .wait_for(|s| s.status.is_terminal())
            .await
            .unwrap();
        // 终态可见时 workflow_complete 已发出，无需等待引擎任务结束
        let events = tokio::time::timeout(Duration::from_secs(2), stream.collect_until_terminal())
            .await
            .unwrap();
        assert_eq!(
            events.last().map(|e| e.event.kind()),
            Some("workflow_complete")
        );
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_tracks_terminal_status() {
        let bus = EventBus::new();
        let engine = engine("print hello", &bus);
        let snapshots = engine.snapshots();
        engine.run().await;
        let snap = snapshots.borrow().clone();
        assert_eq!(snap.status, SessionStatus::Completed);
        assert_eq!(snap.current, 1);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.executing_steps, 0);
    }
}
