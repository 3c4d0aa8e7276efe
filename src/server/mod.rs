//! WebSocket 前端：每个连接对应一个会话，转发该会话的事件流；另附 HTTP 健康检查与指标

pub mod http;
pub mod hub;
pub mod message;

pub use hub::Hub;
pub use message::{ClientFrame, ServerFrame};
