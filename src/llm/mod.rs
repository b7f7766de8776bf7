//! 推理层：推理服务线协议与传输（WebSocket / 脚本化 Mock）

pub mod mock;
pub mod protocol;
pub mod transport;

pub use mock::ScriptedTransport;
pub use protocol::{
    ChatOutcome, ChatRequest, ResponseAccumulator, ServerFrame, StreamEvent, ToolCall, ToolChoice,
    ToolDefinition, WireMessage,
};
pub use transport::{EventSink, InferenceTransport, WsTransport, DEFAULT_TIMEOUT_SECS};
