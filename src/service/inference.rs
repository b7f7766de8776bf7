//! 推理服务：WebSocket 流式对话传输（`ws://host:port/ws`），不打印就绪行
//!
//! 就绪判定：固定宽限期内进程未退出，随后最多 retry_count 次健康轮询；
//! 全部失败时仍视为就绪（仅告警），由后续健康检查兜底。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Child;

use crate::service::managed::{ProcessService, ServiceVariant, HEALTH_CHECK_TIMEOUT};
use crate::service::process::{base_command, forward_output, health_url, http_check};
use crate::service::{ServiceConfig, ServiceEndpoint};

pub const ENV_HOST: &str = "LLM_WS_HOST";
pub const ENV_PORT: &str = "LLM_WS_PORT";
/// 有序启动时注入的自动化服务地址
pub const ENV_MCP_SERVER_URL: &str = "MCP_SERVER_URL";
/// metadata 中的 WebSocket 地址
pub const META_WS_URL: &str = "ws_url";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 18061;

pub type InferenceService = ProcessService<InferenceVariant>;

#[derive(Debug, Clone)]
pub struct InferenceVariant {
    host: String,
    port: u16,
    grace: Duration,
    /// 就绪阶段单次健康轮询的上限；连接被接受却不应答时也不会拖到 startup_timeout
    check_timeout: Duration,
    http: reqwest::Client,
}

impl InferenceVariant {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            grace: Duration::from_millis(1500),
            check_timeout: HEALTH_CHECK_TIMEOUT,
            http: check_client(HEALTH_CHECK_TIMEOUT),
        }
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self.http = check_client(timeout);
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn endpoint(&self) -> ServiceEndpoint {
        let address = format!("{}:{}", self.host, self.port);
        let base_url = format!("http://{}", address);
        let ws_url = format!("ws://{}/ws", address);
        ServiceEndpoint::new(address, base_url).with_extra(META_WS_URL, ws_url)
    }
}

fn check_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

impl Default for InferenceVariant {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

pub fn inference_service(config: ServiceConfig, variant: InferenceVariant) -> InferenceService {
    ProcessService::new(config, variant)
}

#[async_trait]
impl ServiceVariant for InferenceVariant {
    fn spawn(&self, config: &ServiceConfig, env: &HashMap<String, String>) -> std::io::Result<Child> {
        let mut env = env.clone();
        env.insert(ENV_HOST.to_string(), self.host.clone());
        env.insert(ENV_PORT.to_string(), self.port.to_string());

        let mut child = base_command(config, &env).spawn()?;
        if let Some(stdout) = child.stdout.take() {
            forward_output(&config.name, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(&config.name, "stderr", stderr);
        }
        Ok(child)
    }

    async fn wait_for_ready(
        &self,
        config: &ServiceConfig,
        child: &mut Child,
    ) -> Result<ServiceEndpoint, String> {
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| format!("wait failed: {}", e))?;
                return Err(format!("process exited during startup ({})", status));
            }
            _ = tokio::time::sleep(self.grace) => {}
        }

        let endpoint = self.endpoint();
        let url = health_url(&endpoint.base_url);
        for attempt in 1..=config.retry_count {
            let check = tokio::time::timeout(self.check_timeout, http_check(&self.http, &url));
            let outcome = check
                .await
                .unwrap_or_else(|_| Err(format!("GET {} timed out after {:?}", url, self.check_timeout)));
            match outcome {
                Ok(()) => {
                    tracing::info!(service = %config.name, attempt, "health endpoint is up");
                    return Ok(endpoint);
                }
                Err(e) => {
                    tracing::debug!(service = %config.name, attempt, "health poll failed: {}", e);
                    if attempt < config.retry_count {
                        tokio::time::sleep(config.retry_delay).await;
                    }
                }
            }
        }

        tracing::warn!(
            service = %config.name,
            "health endpoint did not answer after {} attempts, assuming ready",
            config.retry_count
        );
        Ok(endpoint)
    }

    async fn check_health(&self, endpoint: &ServiceEndpoint) -> Result<(), String> {
        http_check(&self.http, &health_url(&endpoint.base_url)).await
    }
}
