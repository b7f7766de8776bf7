//! 应用装配：服务监管 -> 工具目录 -> 推理传输 -> Agent 编排器
//!
//! 启动顺序：启动自动化服务并等待就绪 -> 把它的 http 地址注入推理服务的 MCP_SERVER_URL
//! -> 启动推理服务 -> 用两者的地址构建 MCP 客户端与 WebSocket 传输。

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;

use crate::agent::{spawn_orchestrator, AgentHandle, AgentLoop, KeywordIntentPolicy, SystemClock};
use crate::config::{AppConfig, AUTOMATION, INFERENCE};
use crate::core::{
    ServiceError, ShutdownCoordinator, ShutdownManager, ShutdownReason, SupervisorCleanup,
    WorkerCleanup,
};
use crate::llm::{InferenceTransport, WsTransport};
use crate::service::inference::{ENV_MCP_SERVER_URL, META_WS_URL};
use crate::service::{
    automation_service, inference_service, ServiceEventKind, ServiceInfo, Supervisor,
};
use crate::tools::{McpClient, ToolBackend, ToolCatalog};

pub struct App {
    config: AppConfig,
    supervisor: Arc<Supervisor>,
    catalog: Arc<ToolCatalog>,
    agent: AgentHandle,
    coordinator: ShutdownCoordinator,
}

/// 按配置注册两个托管服务（不启动）
pub async fn build_supervisor(config: &AppConfig) -> Result<Arc<Supervisor>, ServiceError> {
    let supervisor = Arc::new(Supervisor::new());
    supervisor
        .register(Arc::new(automation_service(config.automation_service_config())))
        .await?;
    supervisor
        .register(Arc::new(inference_service(
            config.inference_service_config(),
            config.inference_variant(),
        )))
        .await?;
    Ok(supervisor)
}

fn ws_url_of(info: &ServiceInfo) -> Option<&str> {
    info.metadata.get(META_WS_URL).map(String::as_str)
}

impl App {
    /// 启动全部服务并装配 Agent；任一服务启动失败时停止已启动的服务
    pub async fn start(config: AppConfig, shutdown: Arc<ShutdownManager>) -> anyhow::Result<Self> {
        let supervisor = build_supervisor(&config).await?;

        if let Err(e) = supervisor
            .start_chain(AUTOMATION, INFERENCE, ENV_MCP_SERVER_URL)
            .await
        {
            tracing::error!(code = e.code(), "startup failed: {}", e);
            supervisor.stop_all().await;
            return Err(e).context("Failed to start services");
        }

        let automation = supervisor.info(AUTOMATION).await?;
        let base_url = automation
            .base_url()
            .context("automation service reported no address")?
            .to_string();
        let inference = supervisor.info(INFERENCE).await?;
        let ws_url = ws_url_of(&inference)
            .context("inference service reported no websocket url")?
            .to_string();
        tracing::info!(%base_url, %ws_url, "services ready");

        let backend = Arc::new(McpClient::new(&base_url).with_timeout(config.tool_timeout()));
        let transport = Arc::new(WsTransport::new(ws_url).with_timeout(config.llm_timeout()));
        Ok(Self::assemble(config, supervisor, backend, transport, shutdown))
    }

    /// 用给定的工具后端与推理传输装配（服务已由调用方启动）
    pub fn assemble(
        config: AppConfig,
        supervisor: Arc<Supervisor>,
        backend: Arc<dyn ToolBackend>,
        transport: Arc<dyn InferenceTransport>,
        shutdown: Arc<ShutdownManager>,
    ) -> Self {
        let catalog = Arc::new(ToolCatalog::new(backend).with_timeout(config.tool_timeout()));
        let agent_loop = AgentLoop::new(
            transport,
            catalog.clone(),
            Arc::new(KeywordIntentPolicy::default()),
            config.agent_settings(),
        );
        let (agent, worker) = spawn_orchestrator(agent_loop, Arc::new(SystemClock), shutdown.token());

        spawn_event_logger(supervisor.subscribe(), shutdown.clone());

        let mut coordinator =
            ShutdownCoordinator::new(shutdown.clone()).with_timeout(config.app.shutdown_timeout_secs);
        coordinator.register(WorkerCleanup::new(shutdown.token(), worker));
        coordinator.register(SupervisorCleanup::new(supervisor.clone()));

        Self {
            config,
            supervisor,
            catalog,
            agent,
            coordinator,
        }
    }

    pub fn agent(&self) -> &AgentHandle {
        &self.agent
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 每个服务一行：名称、状态、pid、地址、最近错误
    pub async fn status_lines(&self) -> Vec<String> {
        self.supervisor
            .all_info()
            .await
            .iter()
            .map(|info| {
                let mut line = format!("{:<12} {}", info.name, info.status);
                if let Some(pid) = info.pid {
                    line.push_str(&format!(" pid={}", pid));
                }
                if let Some(url) = info.base_url() {
                    line.push_str(&format!(" url={}", url));
                }
                if let Some(ws) = ws_url_of(info) {
                    line.push_str(&format!(" ws={}", ws));
                }
                if let Some(err) = &info.last_error {
                    line.push_str(&format!(" error={}", err));
                }
                line
            })
            .collect()
    }

    /// 重启单个服务；自动化服务换了端口时刷新工具目录，并让推理服务下次启动时拿到新地址
    pub async fn restart_service(&self, name: &str) -> anyhow::Result<()> {
        self.supervisor
            .restart_service(name)
            .await
            .with_context(|| format!("Failed to restart {}", name))?;

        if name == AUTOMATION {
            let info = self.supervisor.info(AUTOMATION).await?;
            if let Some(base_url) = info.base_url() {
                tracing::info!(%base_url, "automation endpoint refreshed");
                self.catalog
                    .set_backend(Arc::new(
                        McpClient::new(base_url).with_timeout(self.config.tool_timeout()),
                    ))
                    .await;
                self.supervisor
                    .get(INFERENCE)
                    .await?
                    .set_env(ENV_MCP_SERVER_URL, base_url);
            }
        }
        Ok(())
    }

    /// 停止 worker 与全部服务
    pub async fn shutdown(&self) {
        let manager = self.coordinator.manager();
        if !manager.is_shutdown() {
            manager.shutdown(ShutdownReason::UserInitiated);
        }
        self.coordinator.run_cleanup().await;
    }
}

/// 服务生命周期事件写日志；异常退出与错误用 warn
fn spawn_event_logger(mut rx: broadcast::Receiver<crate::service::ServiceEvent>, shutdown: Arc<ShutdownManager>) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.wait_for_shutdown() => break,
                event = rx.recv() => event,
            };
            match event {
                Ok(ev) => match &ev.kind {
                    ServiceEventKind::Error { message } => {
                        tracing::warn!(topic = %ev.topic(), "{}", message);
                    }
                    ServiceEventKind::Exited { code } => {
                        tracing::warn!(topic = %ev.topic(), ?code, "service exited");
                    }
                    _ => tracing::debug!(topic = %ev.topic(), "service event"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("service event logger lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
