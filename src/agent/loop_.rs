//! 工具调用主循环
//!
//! 每条用户消息：追加 user -> 确保工具目录 -> 最多 MAX_ITERATIONS 轮
//! （构建模型消息 -> 推理 -> 有工具调用则依次执行并回灌结果 -> 无工具调用则结束）。
//! 第一轮预期需要工具却没有调用时，追加纠正指令并在第二轮强制该工具，仅一次；
//! 强制后仍无调用且 finish_reason 为 stop，判定模型不支持工具调用。

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};

use crate::agent::events::AgentEvent;
use crate::agent::intent::ToolIntentPolicy;
use crate::agent::message::{Clock, ConversationState, Message, MessageMetadata, Role};
use crate::core::AgentError;
use crate::llm::{
    ChatOutcome, ChatRequest, InferenceTransport, StreamEvent, ToolCall, ToolChoice, WireMessage,
};
use crate::tools::ToolCatalog;

/// 单条用户消息最多推理轮数
pub const MAX_ITERATIONS: usize = 6;

const PREVIEW_CHARS: usize = 200;

/// 推理参数
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: String,
    pub temperature: f32,
    pub system_prompt: String,
    pub max_iterations: usize,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.3,
            system_prompt: String::new(),
            max_iterations: MAX_ITERATIONS,
        }
    }
}

/// 会话的唯一写入方：修改状态后发布 watch 快照，并广播细粒度事件
pub struct Conversation {
    state: ConversationState,
    clock: Arc<dyn Clock>,
    state_tx: watch::Sender<ConversationState>,
    events: broadcast::Sender<AgentEvent>,
}

impl Conversation {
    pub fn new(
        clock: Arc<dyn Clock>,
        state_tx: watch::Sender<ConversationState>,
        events: broadcast::Sender<AgentEvent>,
    ) -> Self {
        Self {
            state: ConversationState::new(),
            clock,
            state_tx,
            events,
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    pub fn emit(&self, event: AgentEvent) {
        let _ = self.events.send(event);
    }

    pub fn append(&mut self, role: Role, content: impl Into<String>, metadata: MessageMetadata) -> String {
        let id = self.state.append(role, content, metadata, self.clock.now());
        self.publish();
        self.emit(AgentEvent::MessageAppended {
            id: id.clone(),
            role,
        });
        id
    }

    pub fn update(&mut self, id: &str, f: impl FnOnce(&mut Message)) {
        if let Some(msg) = self.state.get_mut(id) {
            f(msg);
            self.publish();
        }
    }

    pub fn set_processing(&mut self, processing: bool) {
        self.state.is_processing = processing;
        self.publish();
        self.emit(AgentEvent::ProcessingChanged {
            is_processing: processing,
        });
    }

    /// 整体替换为空会话
    pub fn reset(&mut self) {
        self.state = ConversationState::new();
        self.publish();
        self.emit(AgentEvent::Reset);
    }
}

pub struct AgentLoop {
    transport: Arc<dyn InferenceTransport>,
    catalog: Arc<ToolCatalog>,
    policy: Arc<dyn ToolIntentPolicy>,
    settings: AgentSettings,
}

impl AgentLoop {
    pub fn new(
        transport: Arc<dyn InferenceTransport>,
        catalog: Arc<ToolCatalog>,
        policy: Arc<dyn ToolIntentPolicy>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            transport,
            catalog,
            policy,
            settings,
        }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// 处理一条用户消息；成功返回最终回复文本，失败时会话中已追加错误气泡
    pub async fn handle(&self, conv: &mut Conversation, text: String) -> Result<String, AgentError> {
        conv.append(Role::User, text, MessageMetadata::default());
        conv.set_processing(true);

        let result = self.run(conv).await;
        match &result {
            Ok((id, _)) => conv.emit(AgentEvent::Completed {
                message_id: id.clone(),
            }),
            Err(e) => {
                tracing::error!(code = e.code(), "agent request failed: {}", e);
                conv.append(Role::Assistant, e.to_string(), MessageMetadata::error());
                conv.emit(AgentEvent::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                });
            }
        }

        conv.set_processing(false);
        result.map(|(_, text)| text)
    }

    async fn run(&self, conv: &mut Conversation) -> Result<(String, String), AgentError> {
        let tools = match self.catalog.definitions().await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::warn!("tool listing failed, continuing without tools: {}", e);
                Vec::new()
            }
        };

        let user_text = conv
            .state()
            .latest_user()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let expected = self.policy.expected_tool(&user_text, &tools);
        if let Some(tool) = &expected {
            tracing::debug!(tool = %tool, "request is expected to need a tool");
        }

        let max = self.settings.max_iterations;
        let mut force_next: Option<String> = None;
        let mut forced_once = false;
        let mut tool_called = false;

        for iteration in 1..=max {
            let forcing = force_next.take();
            let may_force_later = expected.is_some() && !tool_called && !forced_once;
            let stream = forcing.is_none() && !may_force_later;

            let choice = match &forcing {
                Some(name) => ToolChoice::Function(name.clone()),
                None => ToolChoice::Auto,
            };
            let request = ChatRequest::new(
                self.settings.model.clone(),
                self.settings.temperature,
                self.model_messages(conv.state()),
            )
            .with_tools(&tools)
            .with_stream(stream)
            .with_tool_choice(&choice);

            tracing::info!(iteration, max, stream, forced = ?forcing, "inference round");
            conv.emit(AgentEvent::IterationStarted {
                iteration,
                max_iterations: max,
                stream,
                forced_tool: forcing.clone(),
            });

            let (outcome, placeholder) = self.infer(conv, &request, stream).await;
            let outcome = match outcome {
                Ok(o) => o,
                Err(e) => {
                    if let Some(id) = placeholder {
                        conv.update(&id, |m| m.metadata.streaming = false);
                    }
                    return Err(e);
                }
            };

            if !outcome.tool_calls.is_empty() {
                tool_called = true;
                let calls = normalize_ids(outcome.tool_calls.clone(), conv.state().len());
                self.record_assistant(conv, placeholder, &outcome, calls.clone());
                self.execute_tools(conv, &calls).await;
                continue;
            }

            if iteration == 1 && may_force_later {
                if let Some(tool) = expected.clone() {
                    tracing::warn!(tool = %tool, "model answered without the expected tool, forcing it next round");
                    let note = corrective_note(&tool);
                    conv.append(
                        Role::System,
                        note,
                        MessageMetadata {
                            corrective: true,
                            ..Default::default()
                        },
                    );
                    force_next = Some(tool);
                    forced_once = true;
                    continue;
                }
            }

            if expected.is_some() && !tool_called && outcome.finish_reason == "stop" && iteration >= 2 {
                if let Some(id) = placeholder {
                    conv.update(&id, |m| m.metadata.streaming = false);
                }
                return Err(AgentError::ToolsUnsupported {
                    model: self.settings.model.clone(),
                });
            }

            let text = outcome.text.clone();
            let id = self.record_assistant(conv, placeholder, &outcome, Vec::new());
            return Ok((id, text));
        }

        Err(AgentError::IterationLimit(max))
    }

    /// 发送请求；流式时把增量写入占位消息（首个增量到达时创建）
    async fn infer(
        &self,
        conv: &mut Conversation,
        request: &ChatRequest,
        stream: bool,
    ) -> (Result<ChatOutcome, AgentError>, Option<String>) {
        if !stream {
            return (self.transport.chat(request, None).await, None);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let chat = self.transport.chat(request, Some(tx));
        tokio::pin!(chat);

        let mut placeholder: Option<String> = None;
        let result = loop {
            tokio::select! {
                biased;
                Some(event) = rx.recv() => on_stream_event(conv, &mut placeholder, event),
                result = &mut chat => break result,
            }
        };
        while let Ok(event) = rx.try_recv() {
            on_stream_event(conv, &mut placeholder, event);
        }
        (result, placeholder)
    }

    /// 落定 assistant 消息：有占位消息则原地定稿，否则追加
    fn record_assistant(
        &self,
        conv: &mut Conversation,
        placeholder: Option<String>,
        outcome: &ChatOutcome,
        calls: Vec<ToolCall>,
    ) -> String {
        match placeholder {
            Some(id) => {
                let text = outcome.text.clone();
                let reason = outcome.finish_reason.clone();
                conv.update(&id, move |m| {
                    m.content = text;
                    m.metadata.streaming = false;
                    m.metadata.finish_reason = Some(reason);
                    m.metadata.tool_calls = calls;
                });
                id
            }
            None => conv.append(
                Role::Assistant,
                outcome.text.clone(),
                MessageMetadata {
                    tool_calls: calls,
                    finish_reason: Some(outcome.finish_reason.clone()),
                    ..Default::default()
                },
            ),
        }
    }

    /// 按模型给出的顺序依次执行
    async fn execute_tools(&self, conv: &mut Conversation, calls: &[ToolCall]) {
        for call in calls {
            conv.emit(AgentEvent::ToolCallStarted {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                arguments: call.arguments.clone(),
            });
            let result = self.catalog.call_tool(&call.name, call.arguments.clone()).await;
            conv.emit(AgentEvent::ToolCallFinished {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                is_error: result.is_error,
                preview: preview(&result.content),
            });
            conv.append(
                Role::Tool,
                result.content,
                MessageMetadata::tool_result(&call.id, &call.name, result.is_error),
            );
        }
    }

    /// 会话 -> 推理请求消息：系统提示在前；错误气泡与空占位不发送，
    /// 纠正指令只在产生它的那条用户消息内有效
    pub fn model_messages(&self, state: &ConversationState) -> Vec<WireMessage> {
        let mut out = Vec::with_capacity(state.len() + 1);
        if !self.settings.system_prompt.trim().is_empty() {
            out.push(WireMessage::new("system", self.settings.system_prompt.clone()));
        }
        let current_turn = state
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(0);
        for (pos, m) in state.messages.iter().enumerate() {
            if m.metadata.corrective && pos < current_turn {
                continue;
            }
            match m.role {
                Role::User | Role::System => out.push(WireMessage::new(m.role.as_str(), m.content.clone())),
                Role::Assistant => {
                    if m.metadata.is_error {
                        continue;
                    }
                    if m.content.is_empty() && m.metadata.tool_calls.is_empty() {
                        continue;
                    }
                    let mut wire = WireMessage::new("assistant", m.content.clone());
                    if !m.metadata.tool_calls.is_empty() {
                        wire.tool_calls = Some(m.metadata.tool_calls.clone());
                    }
                    out.push(wire);
                }
                Role::Tool => {
                    let mut wire = WireMessage::new("tool", m.content.clone());
                    wire.tool_call_id = m.metadata.tool_call_id.clone();
                    out.push(wire);
                }
            }
        }
        out
    }
}

fn on_stream_event(conv: &mut Conversation, placeholder: &mut Option<String>, event: StreamEvent) {
    let StreamEvent::Content { text } = event else {
        return;
    };
    if text.is_empty() {
        return;
    }
    let id = match placeholder {
        Some(id) => id.clone(),
        None => {
            let id = conv.append(
                Role::Assistant,
                "",
                MessageMetadata {
                    streaming: true,
                    ..Default::default()
                },
            );
            *placeholder = Some(id.clone());
            id
        }
    };
    let delta = text.clone();
    conv.update(&id, move |m| m.content.push_str(&delta));
    conv.emit(AgentEvent::ContentDelta { id, text });
}

/// 服务端没给调用 ID 时按会话位置生成，保证可重放
fn normalize_ids(calls: Vec<ToolCall>, position: usize) -> Vec<ToolCall> {
    calls
        .into_iter()
        .enumerate()
        .map(|(i, mut call)| {
            if call.id.trim().is_empty() {
                call.id = format!("call_{}_{}", position, i);
            }
            call
        })
        .collect()
}

fn corrective_note(tool: &str) -> String {
    format!(
        "The user's request requires live data or an action on the platform. \
         You must call the `{}` tool now with suitable arguments instead of answering directly.",
        tool
    )
}

fn preview(content: &str) -> String {
    if content.chars().count() > PREVIEW_CHARS {
        format!("{}...", content.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        content.to_string()
    }
}

/// 系统提示缺省值
pub fn default_system_prompt() -> String {
    "You are a content assistant for a social content platform. You can search, browse, \
     publish and manage content through the available tools.\n\
     Whenever the user asks for live information, searching, viewing details, logging in or \
     publishing, you must call the matching tool instead of saying you cannot do it. \
     Answer in the user's language."
        .to_string()
}
