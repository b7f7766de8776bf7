//! Agent 编排器：单 worker 串行消费无界 FIFO 命令队列
//!
//! 同一时刻只有一个请求在处理；某个请求失败不会阻塞后续请求。
//! 状态快照走 watch 通道，细粒度事件走 broadcast 通道。

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::events::AgentEvent;
use crate::agent::loop_::{AgentLoop, Conversation};
use crate::agent::message::{Clock, ConversationState};
use crate::core::AgentError;

const EVENT_CAPACITY: usize = 256;

/// 发往 worker 的命令
#[derive(Debug)]
pub enum Command {
    /// 处理一条用户消息；reply 收到最终回复或错误
    Submit {
        text: String,
        reply: Option<oneshot::Sender<Result<String, AgentError>>>,
    },
    /// 清空会话（整体替换）
    Reset { reply: Option<oneshot::Sender<()>> },
}

/// 编排器句柄：可克隆，多处提交
#[derive(Clone)]
pub struct AgentHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConversationState>,
    events: broadcast::Sender<AgentEvent>,
}

/// 启动 worker；shutdown 取消或所有句柄释放时退出
pub fn spawn_orchestrator(
    agent: AgentLoop,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
) -> (AgentHandle, JoinHandle<()>) {
    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();
    let (state_tx, state_rx) = watch::channel(ConversationState::new());
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    let mut conv = Conversation::new(clock, state_tx, events.clone());
    let worker = tokio::spawn(async move {
        loop {
            let cmd = tokio::select! {
                _ = shutdown.cancelled() => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => cmd,
                    None => break,
                },
            };
            match cmd {
                Command::Submit { text, reply } => {
                    let result = agent.handle(&mut conv, text).await;
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                Command::Reset { reply } => {
                    tracing::info!("conversation reset");
                    conv.reset();
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                }
            }
        }
        tracing::debug!("agent worker stopped");
    });

    (
        AgentHandle {
            cmd_tx,
            state_rx,
            events,
        },
        worker,
    )
}

impl AgentHandle {
    /// 入队后立即返回；返回的 receiver 在该请求处理完时收到结果
    pub fn submit(
        &self,
        text: impl Into<String>,
    ) -> Result<oneshot::Receiver<Result<String, AgentError>>, AgentError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Submit {
                text: text.into(),
                reply: Some(tx),
            })
            .map_err(|_| AgentError::QueueClosed)?;
        Ok(rx)
    }

    /// 入队并等待该请求完成
    pub async fn send_user_message(&self, text: impl Into<String>) -> Result<String, AgentError> {
        let rx = self.submit(text)?;
        rx.await.map_err(|_| AgentError::QueueClosed)?
    }

    /// 排在已入队请求之后执行
    pub async fn reset(&self) -> Result<(), AgentError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Reset { reply: Some(tx) })
            .map_err(|_| AgentError::QueueClosed)?;
        rx.await.map_err(|_| AgentError::QueueClosed)
    }

    pub fn snapshot(&self) -> ConversationState {
        self.state_rx.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConversationState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::agent::intent::{KeywordIntentPolicy, NoIntentPolicy, ToolIntentPolicy};
    use crate::agent::loop_::AgentSettings;
    use crate::agent::message::{FixedClock, Role};
    use crate::llm::{ScriptedTransport, ServerFrame};
    use crate::tools::catalog::mock::StaticBackend;
    use crate::tools::ToolCatalog;

    fn spawn(
        transport: Arc<ScriptedTransport>,
        backend: StaticBackend,
        policy: Arc<dyn ToolIntentPolicy>,
    ) -> (AgentHandle, CancellationToken) {
        let catalog = Arc::new(ToolCatalog::new(Arc::new(backend)));
        let agent = AgentLoop::new(transport, catalog, policy, AgentSettings::default());
        let token = CancellationToken::new();
        let (handle, _worker) = spawn_orchestrator(agent, Arc::new(FixedClock::epoch()), token.clone());
        (handle, token)
    }

    #[tokio::test]
    async fn test_requests_are_serialized_in_fifo_order() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_text("first answer").push_text("second answer");
        let (handle, _token) = spawn(transport, StaticBackend::default(), Arc::new(NoIntentPolicy));
        let mut events = handle.subscribe();

        let first = handle.submit("one").unwrap();
        let second = handle.submit("two").unwrap();
        assert_eq!(second.await.unwrap().unwrap(), "second answer");
        assert_eq!(first.await.unwrap().unwrap(), "first answer");

        // 第二条 user 消息必须在第一次 ProcessingChanged(false) 之后追加
        let mut log = Vec::new();
        while let Ok(ev) = events.try_recv() {
            match ev {
                AgentEvent::ProcessingChanged { is_processing } => log.push(format!("processing:{}", is_processing)),
                AgentEvent::MessageAppended { role: Role::User, .. } => log.push("user".to_string()),
                _ => {}
            }
        }
        assert_eq!(
            log,
            vec!["user", "processing:true", "processing:false", "user", "processing:true", "processing:false"]
        );

        let state = handle.snapshot();
        let contents: Vec<&str> = state.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "first answer", "two", "second answer"]);
    }

    #[tokio::test]
    async fn test_failure_does_not_block_later_requests() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .push(vec![ServerFrame::error("model overloaded")])
            .push_text("recovered");
        let (handle, _token) = spawn(transport, StaticBackend::default(), Arc::new(NoIntentPolicy));

        let err = handle.send_user_message("one").await.unwrap_err();
        assert_eq!(err, AgentError::Transport("model overloaded".into()));
        assert_eq!(handle.send_user_message("two").await.unwrap(), "recovered");

        let state = handle.snapshot();
        assert!(state.messages[1].metadata.is_error);
        assert!(!state.is_processing);
    }

    #[tokio::test]
    async fn test_reset_replaces_state() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_text("hello").push_text("again");
        let (handle, _token) = spawn(transport, StaticBackend::default(), Arc::new(NoIntentPolicy));

        handle.send_user_message("hi").await.unwrap();
        handle.reset().await.unwrap();
        assert!(handle.snapshot().is_empty());

        handle.send_user_message("hi").await.unwrap();
        assert_eq!(handle.snapshot().messages[0].id, "msg_1");
    }

    #[tokio::test]
    async fn test_replay_yields_identical_state() {
        async fn run() -> ConversationState {
            let transport = Arc::new(ScriptedTransport::new());
            transport
                .push(vec![
                    ServerFrame::tool_call("call_1", "search_feeds", json!({"keyword": "tea"})),
                    ServerFrame::done("tool_calls"),
                ])
                .push_text("Tea results.");
            let backend = StaticBackend::with_tools(&["search_feeds"]).with_result("search_feeds", "2 tea shops");
            let (handle, _token) = spawn(transport, backend, Arc::new(KeywordIntentPolicy::default()));
            handle.send_user_message("search tea").await.unwrap();
            handle.snapshot()
        }
        assert_eq!(run().await, run().await);
    }

    #[tokio::test]
    async fn test_shutdown_closes_queue() {
        let transport = Arc::new(ScriptedTransport::new());
        let catalog = Arc::new(ToolCatalog::new(Arc::new(StaticBackend::default())));
        let agent = AgentLoop::new(transport, catalog, Arc::new(NoIntentPolicy), AgentSettings::default());
        let token = CancellationToken::new();
        let (handle, worker) = spawn_orchestrator(agent, Arc::new(FixedClock::epoch()), token.clone());

        token.cancel();
        worker.await.unwrap();
        assert_eq!(handle.send_user_message("late").await.unwrap_err(), AgentError::QueueClosed);
    }
}
