//! 对话历史：消息、元数据与会话状态
//!
//! 只追加；唯一的原地修改是流式输出时最新 assistant 占位消息的增长。
//! 消息 ID 按会话顺序编号（`msg_<n>`），时间戳来自可注入的时钟，相同输入可重放出相同状态。

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::ToolCall;

/// 消息角色（与推理服务一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    /// assistant 发起的工具调用
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// tool 消息对应的调用 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// 错误气泡（assistant）或失败的工具结果（tool）
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// 流式输出中的占位消息
    #[serde(default)]
    pub streaming: bool,
    /// 强制工具调用前追加的纠正指令
    #[serde(default)]
    pub corrective: bool,
}

impl MessageMetadata {
    pub fn tool_result(call_id: &str, tool: &str, is_error: bool) -> Self {
        Self {
            tool_call_id: Some(call_id.to_string()),
            tool_name: Some(tool.to_string()),
            is_error,
            ..Default::default()
        }
    }

    pub fn error() -> Self {
        Self {
            is_error: true,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

/// 时间来源
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 固定时间（测试 / 重放）
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn epoch() -> Self {
        Self(Utc.timestamp_opt(0, 0).single().unwrap_or_default())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// 会话状态快照：消息列表 + 是否在处理中
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConversationState {
    pub messages: Vec<Message>,
    pub is_processing: bool,
    #[serde(skip)]
    next_seq: u64,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一条消息，返回其 ID
    pub fn append(
        &mut self,
        role: Role,
        content: impl Into<String>,
        metadata: MessageMetadata,
        at: DateTime<Utc>,
    ) -> String {
        self.next_seq += 1;
        let id = format!("msg_{}", self.next_seq);
        self.messages.push(Message {
            id: id.clone(),
            role,
            content: content.into(),
            created_at: at,
            metadata,
        });
        id
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn latest_user(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
