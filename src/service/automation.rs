//! 自动化服务：启动后在 stdout 打印 `APP_SERVER_ADDR=<host:port>`，提供 HTTP 控制 API 与 MCP 端点

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;

use crate::service::managed::{ProcessService, ServiceVariant};
use crate::service::process::{
    base_command, base_url_from_address, forward_lines, forward_output, health_url, http_check,
    normalize_address, parse_ready_line,
};
use crate::service::{ServiceConfig, ServiceEndpoint};

/// 就绪行前缀
pub const READY_PREFIX: &str = "APP_SERVER_ADDR=";

pub type AutomationService = ProcessService<AutomationVariant>;

pub struct AutomationVariant {
    http: reqwest::Client,
}

impl AutomationVariant {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for AutomationVariant {
    fn default() -> Self {
        Self::new()
    }
}

/// 以默认参数创建自动化服务（桌面模式、随机端口）
pub fn automation_service(config: ServiceConfig) -> AutomationService {
    ProcessService::new(config, AutomationVariant::new())
}

#[async_trait]
impl ServiceVariant for AutomationVariant {
    fn spawn(&self, config: &ServiceConfig, env: &HashMap<String, String>) -> std::io::Result<Child> {
        let mut child = base_command(config, env).spawn()?;
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
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "stdout is not captured".to_string())?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| format!("failed to read stdout: {}", e))?;
            let Some(line) = line else {
                return Err(format!("stdout closed before {} was printed", READY_PREFIX));
            };
            match parse_ready_line(&line, READY_PREFIX) {
                Some(addr) => {
                    let address = normalize_address(addr);
                    let base_url = base_url_from_address(&address);
                    tracing::info!(service = %config.name, %address, "readiness line received");
                    forward_lines(config.name.clone(), "stdout", lines);
                    return Ok(ServiceEndpoint::new(address, base_url));
                }
                None => tracing::debug!(service = %config.name, stream = "stdout", "{}", line),
            }
        }
    }

    async fn check_health(&self, endpoint: &ServiceEndpoint) -> Result<(), String> {
        http_check(&self.http, &health_url(&endpoint.base_url)).await
    }
}
