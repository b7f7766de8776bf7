//! 推理服务线协议：请求 JSON、服务端帧、流式事件与响应累积
//!
//! 请求：`{type:"chat", messages, tools, config:{model, temperature, stream, tool_choice?}}`
//! 响应帧：`chunk` / `tool_call` / `done` / `error`，每帧带 `done` 标志（此处忽略，以 type 为准）。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// 模型可见的工具定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema
    pub parameters: Value,
}

/// 模型发起的一次工具调用（arguments 已解析为 JSON 对象）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// 请求中的一条消息；assistant 的 tool_calls 以扁平 `{id, name, arguments}` 发送
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl WireMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: WireFunction,
}

impl From<&ToolDefinition> for WireTool {
    fn from(def: &ToolDefinition) -> Self {
        Self {
            kind: "function".to_string(),
            function: WireFunction {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters: def.parameters.clone(),
            },
        }
    }
}

/// 工具选择：默认 auto（不下发）；强制时指定函数名
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    Function(String),
}

impl ToolChoice {
    fn to_value(&self) -> Option<Value> {
        match self {
            ToolChoice::Auto => None,
            ToolChoice::Function(name) => Some(json!({
                "type": "function",
                "function": { "name": name }
            })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatConfig {
    pub model: String,
    pub temperature: f32,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub messages: Vec<WireMessage>,
    pub tools: Vec<WireTool>,
    pub config: ChatConfig,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, temperature: f32, messages: Vec<WireMessage>) -> Self {
        Self {
            kind: "chat".to_string(),
            messages,
            tools: Vec::new(),
            config: ChatConfig {
                model: model.into(),
                temperature,
                stream: true,
                tool_choice: None,
            },
        }
    }

    pub fn with_tools(mut self, tools: &[ToolDefinition]) -> Self {
        self.tools = tools.iter().map(WireTool::from).collect();
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.config.stream = stream;
        self
    }

    pub fn with_tool_choice(mut self, choice: &ToolChoice) -> Self {
        self.config.tool_choice = choice.to_value();
        self
    }

    /// 被强制的函数名（若有）
    pub fn forced_tool(&self) -> Option<&str> {
        self.config
            .tool_choice
            .as_ref()
            .and_then(|v| v.pointer("/function/name"))
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameFunction {
    pub name: String,
    /// 可能是对象，也可能是 JSON 字符串
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameToolCall {
    #[serde(default)]
    pub id: String,
    pub function: FrameFunction,
}

impl From<FrameToolCall> for ToolCall {
    fn from(raw: FrameToolCall) -> Self {
        Self {
            id: raw.id,
            name: raw.function.name,
            arguments: parse_arguments(raw.function.arguments),
        }
    }
}

/// 字符串形式的参数解析为 JSON；无法解析或非对象时为 `{}`
pub fn parse_arguments(raw: Value) -> Value {
    match raw {
        Value::Object(_) => raw,
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(v @ Value::Object(_)) => v,
            _ => json!({}),
        },
        _ => json!({}),
    }
}

/// 服务端帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Chunk {
        #[serde(default)]
        content: String,
    },
    ToolCall {
        #[serde(default)]
        tool_calls: Vec<FrameToolCall>,
    },
    Done {
        #[serde(default)]
        finish_reason: Option<String>,
        #[serde(default)]
        content: Option<String>,
    },
    Error {
        #[serde(default)]
        error: String,
    },
}

impl ServerFrame {
    pub fn chunk(content: impl Into<String>) -> Self {
        ServerFrame::Chunk {
            content: content.into(),
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        ServerFrame::ToolCall {
            tool_calls: vec![FrameToolCall {
                id: id.into(),
                function: FrameFunction {
                    name: name.into(),
                    arguments,
                },
            }],
        }
    }

    pub fn done(finish_reason: impl Into<String>) -> Self {
        ServerFrame::Done {
            finish_reason: Some(finish_reason.into()),
            content: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        ServerFrame::Error {
            error: error.into(),
        }
    }
}

/// 传给调用方的流式事件；每个请求以恰好一个 Done 或 Error 结束
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Content { text: String },
    ToolCall { calls: Vec<ToolCall> },
    Done { finish_reason: String, full_text: String },
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

/// 一次请求的最终结果
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
}

/// 累积 chunk 文本；tool_call 帧覆盖已有调用；done 优先使用服务端给出的全文
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    text: String,
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<String>,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, frame: ServerFrame) -> StreamEvent {
        match frame {
            ServerFrame::Chunk { content } => {
                self.text.push_str(&content);
                StreamEvent::Content { text: content }
            }
            ServerFrame::ToolCall { tool_calls } => {
                self.tool_calls = tool_calls.into_iter().map(ToolCall::from).collect();
                StreamEvent::ToolCall {
                    calls: self.tool_calls.clone(),
                }
            }
            ServerFrame::Done {
                finish_reason,
                content,
            } => {
                if let Some(full) = content.filter(|c| !c.is_empty()) {
                    self.text = full;
                }
                let reason = finish_reason.unwrap_or_else(|| {
                    if self.tool_calls.is_empty() {
                        "stop".to_string()
                    } else {
                        "tool_calls".to_string()
                    }
                });
                self.finish_reason = Some(reason.clone());
                StreamEvent::Done {
                    finish_reason: reason,
                    full_text: self.text.clone(),
                }
            }
            ServerFrame::Error { error } => StreamEvent::Error { message: error },
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_outcome(self) -> ChatOutcome {
        ChatOutcome {
            text: self.text,
            tool_calls: self.tool_calls,
            finish_reason: self.finish_reason.unwrap_or_else(|| "stop".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_accumulate_when_done_has_no_content() {
        let mut acc = ResponseAccumulator::new();
        acc.handle(ServerFrame::chunk("Hel"));
        acc.handle(ServerFrame::chunk("lo"));
        let ev = acc.handle(ServerFrame::done("stop"));
        assert_eq!(
            ev,
            StreamEvent::Done {
                finish_reason: "stop".into(),
                full_text: "Hello".into()
            }
        );
        assert_eq!(acc.into_outcome().text, "Hello");
    }

    #[test]
    fn test_done_content_wins_over_buffer() {
        let mut acc = ResponseAccumulator::new();
        acc.handle(ServerFrame::chunk("partial"));
        acc.handle(ServerFrame::Done {
            finish_reason: Some("stop".into()),
            content: Some("complete answer".into()),
        });
        assert_eq!(acc.into_outcome().text, "complete answer");
    }

    #[test]
    fn test_tool_call_frame_overwrites_and_parses_string_arguments() {
        let mut acc = ResponseAccumulator::new();
        acc.handle(ServerFrame::tool_call("a", "list_feeds", json!({})));
        acc.handle(ServerFrame::tool_call(
            "call_1",
            "search_feeds",
            Value::String(r#"{"keyword":"咖啡"}"#.into()),
        ));
        let outcome = acc.into_outcome();
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].name, "search_feeds");
        assert_eq!(outcome.tool_calls[0].arguments, json!({"keyword": "咖啡"}));
    }

    #[test]
    fn test_unparsable_arguments_become_empty_object() {
        assert_eq!(parse_arguments(Value::String("{not json".into())), json!({}));
        assert_eq!(parse_arguments(Value::Null), json!({}));
    }

    #[test]
    fn test_server_frames_deserialize_from_wire() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"chunk","content":"hi","done":false}"#).unwrap();
        assert_eq!(frame, ServerFrame::chunk("hi"));

        let frame: ServerFrame = serde_json::from_str(
            r#"{"type":"tool_call","tool_calls":[{"id":"c1","type":"function","function":{"name":"list_feeds","arguments":{}}}],"done":false}"#,
        )
        .unwrap();
        assert!(matches!(frame, ServerFrame::ToolCall { ref tool_calls } if tool_calls[0].function.name == "list_feeds"));

        let frame: ServerFrame =
            serde_json::from_str(r#"{"type":"error","error":"bad key","done":true}"#).unwrap();
        assert_eq!(frame, ServerFrame::error("bad key"));
    }

    #[test]
    fn test_request_shape() {
        let tools = vec![ToolDefinition {
            name: "search_feeds".into(),
            description: "Search".into(),
            parameters: json!({"type": "object", "properties": {}}),
        }];
        let mut assistant = WireMessage::new("assistant", "");
        assistant.tool_calls = Some(vec![ToolCall {
            id: "c1".into(),
            name: "search_feeds".into(),
            arguments: json!({"keyword": "x"}),
        }]);
        let req = ChatRequest::new("gpt-4o-mini", 0.3, vec![WireMessage::new("user", "hi"), assistant])
            .with_tools(&tools)
            .with_stream(false)
            .with_tool_choice(&ToolChoice::Function("search_feeds".into()));

        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["type"], "chat");
        assert_eq!(v["tools"][0]["type"], "function");
        assert_eq!(v["tools"][0]["function"]["name"], "search_feeds");
        assert_eq!(v["config"]["stream"], false);
        assert_eq!(v["config"]["tool_choice"]["function"]["name"], "search_feeds");
        assert_eq!(v["messages"][1]["tool_calls"][0]["arguments"]["keyword"], "x");
        assert!(v["messages"][0].get("tool_call_id").is_none());
        assert_eq!(req.forced_tool(), Some("search_feeds"));

        let auto = ChatRequest::new("m", 0.3, vec![]).with_tool_choice(&ToolChoice::Auto);
        assert!(serde_json::to_value(&auto).unwrap()["config"].get("tool_choice").is_none());
    }
}
