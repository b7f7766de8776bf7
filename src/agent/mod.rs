//! Agent 编排：对话历史、工具意图策略、工具调用主循环与串行请求队列

pub mod events;
pub mod intent;
pub mod loop_;
pub mod message;
pub mod orchestrator;

pub use events::AgentEvent;
pub use intent::{IntentRule, KeywordIntentPolicy, NoIntentPolicy, ToolIntentPolicy};
pub use loop_::{default_system_prompt, AgentLoop, AgentSettings, Conversation, MAX_ITERATIONS};
pub use message::{
    Clock, ConversationState, FixedClock, Message, MessageMetadata, Role, SystemClock,
};
pub use orchestrator::{spawn_orchestrator, AgentHandle, Command};
