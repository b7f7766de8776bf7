//! Agent 过程事件：供前端渲染流式文本、工具调用与错误

use serde::Serialize;
use serde_json::Value;

use crate::agent::message::Role;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ProcessingChanged { is_processing: bool },
    MessageAppended { id: String, role: Role },
    /// 第几轮推理；forced_tool 为本轮强制的工具
    IterationStarted {
        iteration: usize,
        max_iterations: usize,
        stream: bool,
        forced_tool: Option<String>,
    },
    /// 流式文本增量（追加到 id 对应的占位消息）
    ContentDelta { id: String, text: String },
    ToolCallStarted {
        call_id: String,
        tool: String,
        arguments: Value,
    },
    ToolCallFinished {
        call_id: String,
        tool: String,
        is_error: bool,
        preview: String,
    },
    /// 请求成功结束，message_id 为最终回复
    Completed { message_id: String },
    Error { code: String, message: String },
    /// 会话被清空
    Reset,
}
