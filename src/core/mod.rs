//! 核心编排层：错误分类、会话状态、会话引擎、注册表、会话监管与组件构建

pub mod builder;
pub mod engine;
pub mod error;
pub mod registry;
pub mod session_supervisor;
pub mod state;

pub use builder::{create_engine_builder, EngineBuilder};
pub use engine::{Collaborators, EnginePolicy, SessionEngine, SessionOutcome};
pub use error::{tag, TerminusError};
pub use registry::{validate_goal, SessionHandle, SessionRegistry};
pub use session_supervisor::SessionSupervisor;
pub use state::{
    new_session_id, Session, SessionId, SessionSnapshot, SessionStatus, Step, StepRecord,
    StepStatus,
};
