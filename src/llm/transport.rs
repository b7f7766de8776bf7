//! 推理传输：每个请求一条 WebSocket 连接，发送请求 JSON，消费服务端帧直到 done / error
//!
//! 看门狗是唯一的取消手段：超时即结束请求，不支持中途由用户取消。

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::core::AgentError;
use crate::llm::protocol::{ChatOutcome, ChatRequest, ResponseAccumulator, ServerFrame, StreamEvent};

/// 默认请求超时（秒）
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// 流式事件的接收端（可选）
pub type EventSink = mpsc::UnboundedSender<StreamEvent>;

#[async_trait]
pub trait InferenceTransport: Send + Sync {
    /// 发送一次对话请求；events 若存在，按到达顺序收到每个流式事件（含终止事件）
    async fn chat(
        &self,
        request: &ChatRequest,
        events: Option<EventSink>,
    ) -> Result<ChatOutcome, AgentError>;
}

/// 把帧喂给累积器并转发事件；返回 Some 表示请求已结束
pub(crate) fn apply_frame(
    acc: &mut ResponseAccumulator,
    frame: ServerFrame,
    events: Option<&EventSink>,
) -> Option<Result<(), AgentError>> {
    let event = acc.handle(frame);
    let terminal = match &event {
        StreamEvent::Done { .. } => Some(Ok(())),
        StreamEvent::Error { message } => Some(Err(AgentError::Transport(message.clone()))),
        _ => None,
    };
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
    terminal
}

pub struct WsTransport {
    ws_url: String,
    timeout: Duration,
}

impl WsTransport {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    async fn exchange(
        &self,
        request: &ChatRequest,
        events: Option<&EventSink>,
    ) -> Result<ChatOutcome, AgentError> {
        let (ws, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| AgentError::Transport(format!("connect {} failed: {}", self.ws_url, e)))?;
        let (mut write, mut read) = ws.split();

        let payload =
            serde_json::to_string(request).map_err(|e| AgentError::Transport(e.to_string()))?;
        write
            .send(WsMessage::Text(payload))
            .await
            .map_err(|e| AgentError::Transport(format!("send failed: {}", e)))?;
        tracing::debug!(
            model = %request.config.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            stream = request.config.stream,
            "chat request sent"
        );

        let mut acc = ResponseAccumulator::new();
        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| AgentError::Transport(e.to_string()))?;
            let text = match msg {
                WsMessage::Text(t) => t,
                WsMessage::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
                WsMessage::Close(_) => break,
                _ => continue,
            };
            let frame: ServerFrame = match serde_json::from_str(&text) {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!("ignoring malformed frame: {} ({})", e, text);
                    continue;
                }
            };
            if let Some(result) = apply_frame(&mut acc, frame, events) {
                let _ = write.close().await;
                return result.map(|_| acc.into_outcome());
            }
        }

        Err(AgentError::ConnectionClosed)
    }
}

#[async_trait]
impl InferenceTransport for WsTransport {
    async fn chat(
        &self,
        request: &ChatRequest,
        events: Option<EventSink>,
    ) -> Result<ChatOutcome, AgentError> {
        match tokio::time::timeout(self.timeout, self.exchange(request, events.as_ref())).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(url = %self.ws_url, "inference request timed out");
                let err = AgentError::Timeout(self.timeout.as_secs());
                if let Some(tx) = &events {
                    let _ = tx.send(StreamEvent::Error {
                        message: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::protocol::WireMessage;
    use tokio::net::TcpListener;

    /// 本地 WebSocket 服务器：读取一条请求，依次回放 frames，然后关闭
    async fn serve(frames: Vec<String>, hold: Duration) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let request = match ws.next().await {
                Some(Ok(WsMessage::Text(t))) => t,
                other => panic!("unexpected first message: {:?}", other),
            };
            for f in frames {
                ws.send(WsMessage::Text(f)).await.unwrap();
            }
            tokio::time::sleep(hold).await;
            let _ = ws.close(None).await;
            request
        });
        (format!("ws://{}/ws", addr), handle)
    }

    fn request() -> ChatRequest {
        ChatRequest::new("test-model", 0.3, vec![WireMessage::new("user", "hi")])
    }

    #[tokio::test]
    async fn test_streams_chunks_then_done() {
        let (url, server) = serve(
            vec![
                r#"{"type":"chunk","content":"Hel","done":false}"#.into(),
                r#"{"type":"chunk","content":"lo","done":false}"#.into(),
                r#"{"type":"done","finish_reason":"stop","done":true}"#.into(),
            ],
            Duration::ZERO,
        )
        .await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = WsTransport::new(url).chat(&request(), Some(tx)).await.unwrap();
        assert_eq!(outcome.text, "Hello");
        assert_eq!(outcome.finish_reason, "stop");

        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        assert_eq!(events.len(), 3);
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let sent: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(sent["type"], "chat");
        assert_eq!(sent["config"]["model"], "test-model");
    }

    #[tokio::test]
    async fn test_error_frame_rejects() {
        let (url, _server) = serve(
            vec![r#"{"type":"error","error":"invalid api key","done":true}"#.into()],
            Duration::ZERO,
        )
        .await;
        let err = WsTransport::new(url).chat(&request(), None).await.unwrap_err();
        assert_eq!(err, AgentError::Transport("invalid api key".into()));
    }

    #[tokio::test]
    async fn test_close_without_done_is_connection_closed() {
        let (url, _server) = serve(
            vec![r#"{"type":"chunk","content":"partial","done":false}"#.into()],
            Duration::ZERO,
        )
        .await;
        let err = WsTransport::new(url).chat(&request(), None).await.unwrap_err();
        assert_eq!(err, AgentError::ConnectionClosed);
    }

    #[tokio::test]
    async fn test_watchdog_times_out() {
        let (url, _server) = serve(vec![], Duration::from_secs(5)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = WsTransport::new(url)
            .with_timeout(Duration::from_millis(200))
            .chat(&request(), Some(tx))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
        assert!(matches!(rx.try_recv(), Ok(StreamEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_connect_failure_is_transport_error() {
        let err = WsTransport::new("ws://127.0.0.1:1/ws")
            .chat(&request(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "transport_error");
    }
}
