//! 事件层：事件类型与按会话有序分发的总线

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventPublisher, EventStream};
pub use types::{CompletionStatus, Event, SessionEvent};
