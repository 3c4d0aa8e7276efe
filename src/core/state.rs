//! 会话状态：Session、Step 与计划拼接
//!
//! Session 只由所属引擎修改。重规划时，当前索引之前的步骤保持不变；
//! 当前失败步骤与未执行的尾部移入 retired，修订后的步骤从当前索引拼入。
//! 每次执行尝试（成功或失败）按时间顺序追加到 executed，只增不改。

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 会话 ID（不透明、唯一）
pub type SessionId = String;

/// 生成 12 位十六进制会话 ID
pub fn new_session_id() -> SessionId {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// 会话状态机的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Planning,
    Executing,
    RePlanning,
    Completed,
    Failed,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Aborted
        )
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Executing,
    Success,
    Failed,
    Superseded,
}

/// 计划中的一个步骤
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub description: String,
    pub status: StepStatus,
    /// 翻译后的命令（翻译成功后设置一次）
    pub command: Option<String>,
    pub stdout: String,
    pub stderr: String,
    /// 仅在执行后存在
    pub exit_code: Option<i32>,
    /// 同一描述的累计尝试次数（重规划保留同描述步骤时延续）
    pub attempts: u32,
}

impl Step {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            status: StepStatus::Pending,
            command: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            attempts: 0,
        }
    }
}

/// 一次执行尝试的记录（重规划上下文）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub step: String,
    /// success 或 failed
    pub status: StepStatus,
    pub command: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl From<&Step> for StepRecord {
    fn from(step: &Step) -> Self {
        let status = match step.exit_code {
            Some(0) => StepStatus::Success,
            Some(_) => StepStatus::Failed,
            None => step.status,
        };
        Self {
            step: step.description.clone(),
            status,
            command: step.command.clone(),
            stdout: step.stdout.clone(),
            stderr: step.stderr.clone(),
            exit_code: step.exit_code,
        }
    }
}

/// 单个工作流实例
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub goal: String,
    pub status: SessionStatus,
    /// 当前计划（前 current 个为已成功的历史）
    pub steps: Vec<Step>,
    pub current: usize,
    pub consecutive_failures: u32,
    /// 被重规划淘汰的步骤（失败步骤与 superseded 的尾部），按淘汰顺序
    pub retired: Vec<Step>,
    /// 所有执行尝试，按时间顺序
    pub executed: Vec<StepRecord>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, goal: impl Into<String>) -> Self {
        Self {
            id,
            goal: goal.into(),
            status: SessionStatus::Planning,
            steps: Vec::new(),
            current: 0,
            consecutive_failures: 0,
            retired: Vec::new(),
            executed: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn plan_descriptions(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.description.clone()).collect()
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current)
    }

    pub fn current_step_mut(&mut self) -> Option<&mut Step> {
        self.steps.get_mut(self.current)
    }

    /// 已执行的尝试，包括失败后被淘汰的步骤
    pub fn history(&self) -> Vec<StepRecord> {
        self.executed.clone()
    }

    /// 当前步骤得到结果后调用，追加一条尝试记录
    pub fn record_attempt(&mut self) {
        if let Some(step) = self.current_step() {
            let record = StepRecord::from(step);
            self.executed.push(record);
        }
    }

    /// 安装初始计划
    pub fn install_plan(&mut self, descriptions: Vec<String>) {
        self.steps = descriptions.into_iter().map(Step::new).collect();
        self.current = 0;
    }

    /// 用修订计划替换当前索引及之后的步骤。
    ///
    /// 当前（失败）步骤保留其 failed 状态移入 retired，其后未执行的步骤标记为 superseded；
    /// 与失败步骤同描述的新步骤延续其尝试次数。
    pub fn splice_revision(&mut self, descriptions: Vec<String>) {
        let tail: Vec<Step> = self.steps.drain(self.current..).collect();
        let failed_attempts = tail
            .first()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| (s.description.clone(), s.attempts));

        for mut step in tail {
            if step.status == StepStatus::Pending {
                step.status = StepStatus::Superseded;
            }
            self.retired.push(step);
        }

        self.steps.extend(descriptions.into_iter().map(|d| {
            let mut step = Step::new(d);
            if let Some((desc, attempts)) = &failed_attempts {
                if *desc == step.description {
                    step.attempts = *attempts;
                }
            }
            step
        }));
    }

    /// 执行中的步骤数（不变量：至多一个，且位于当前索引）
    pub fn executing_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Executing)
            .count()
    }
}

/// 会话的轻量快照（供注册表查询）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub current: usize,
    pub step_count: usize,
    pub consecutive_failures: u32,
    /// 处于 executing 的步骤数
    pub executing_steps: usize,
}

impl From<&Session> for SessionSnapshot {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.id.clone(),
            status: s.status,
            current: s.current,
            step_count: s.steps.len(),
            consecutive_failures: s.consecutive_failures,
            executing_steps: s.executing_count(),
        }
    }
}
