//! 脚本化推理传输（用于测试，无需推理服务）
//!
//! 每次 chat 弹出一段预设帧序列，走与 WebSocket 相同的累积逻辑；记录收到的请求供断言。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::AgentError;
use crate::llm::protocol::{ChatOutcome, ChatRequest, ResponseAccumulator, ServerFrame};
use crate::llm::transport::{apply_frame, EventSink, InferenceTransport};

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Vec<ServerFrame>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一轮回复
    pub fn push(&self, frames: Vec<ServerFrame>) -> &Self {
        self.lock_script().push_back(frames);
        self
    }

    /// 一轮纯文本回复
    pub fn push_text(&self, text: &str) -> &Self {
        self.push(vec![ServerFrame::chunk(text), ServerFrame::done("stop")])
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<ServerFrame>>> {
        self.script.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl InferenceTransport for ScriptedTransport {
    async fn chat(
        &self,
        request: &ChatRequest,
        events: Option<EventSink>,
    ) -> Result<ChatOutcome, AgentError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());

        let frames = self
            .lock_script()
            .pop_front()
            .ok_or_else(|| AgentError::Transport("script exhausted".to_string()))?;

        let mut acc = ResponseAccumulator::new();
        for frame in frames {
            if let Some(result) = apply_frame(&mut acc, frame, events.as_ref()) {
                return result.map(|_| acc.into_outcome());
            }
        }
        Err(AgentError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::protocol::WireMessage;

    #[tokio::test]
    async fn test_script_replays_in_order_and_records_requests() {
        let t = ScriptedTransport::new();
        t.push_text("first").push(vec![ServerFrame::chunk("cut off")]);

        let req = ChatRequest::new("m", 0.3, vec![WireMessage::new("user", "hi")]);
        assert_eq!(t.chat(&req, None).await.unwrap().text, "first");
        assert_eq!(t.chat(&req, None).await.unwrap_err(), AgentError::ConnectionClosed);
        assert!(t.chat(&req, None).await.is_err());
        assert_eq!(t.requests().len(), 3);
    }
}
