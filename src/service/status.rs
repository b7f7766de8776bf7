//! 托管服务的数据模型：状态机、配置、只读快照与生命周期事件

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// metadata 中的监听地址（host:port）
pub const META_ADDRESS: &str = "address";
/// metadata 中的 HTTP 基础 URL
pub const META_BASE_URL: &str = "base_url";
/// metadata 中最近一次进程退出码
pub const META_EXIT_CODE: &str = "exit_code";

/// 服务状态
///
/// 合法迁移：Stopped→Starting→Running→Stopping→Stopped，
/// Starting→Error、Running→Error（健康检查失败 / 进程退出），Error→Stopping。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServiceStatus {
    pub fn can_transition_to(self, next: ServiceStatus) -> bool {
        use ServiceStatus::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Running, Error)
                | (Running, Stopping)
                | (Error, Stopping)
                | (Stopping, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Error => "error",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 服务配置：由 Supervisor 持有，构造后不再修改（环境变量注入走 ManagedService::set_env）
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// 唯一名称（注册表的 key）
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    /// 覆盖变体自带的健康检查地址
    pub health_check_url: Option<String>,
    pub health_check_interval: Duration,
    /// 等待就绪信号的上限；超时即启动失败
    pub startup_timeout: Duration,
    /// 就绪阶段健康轮询次数与间隔
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// SIGTERM 之后等待退出的时间，超时强杀
    pub stop_timeout: Duration,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            health_check_url: None,
            health_check_interval: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(30),
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_health_check_url(mut self, url: impl Into<String>) -> Self {
        self.health_check_url = Some(url.into());
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

/// 服务对外可用的端点（就绪后由变体给出）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// host:port
    pub address: String,
    /// http://host:port
    pub base_url: String,
    /// 变体特有的附加地址（如 ws_url）
    pub extra: BTreeMap<String, String>,
}

impl ServiceEndpoint {
    pub fn new(address: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            base_url: base_url.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// 服务只读快照：按需重新计算，调用方不可原地修改
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    pub status: ServiceStatus,
    /// 是否持有子进程句柄
    pub has_process: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInfo {
    pub fn address(&self) -> Option<&str> {
        self.metadata.get(META_ADDRESS).map(String::as_str)
    }

    pub fn base_url(&self) -> Option<&str> {
        self.metadata.get(META_BASE_URL).map(String::as_str)
    }
}

/// 生命周期事件（替代回调式 observer：订阅方从 broadcast 通道读取）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceEvent {
    pub service: String,
    pub kind: ServiceEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceEventKind {
    StatusChanged {
        from: ServiceStatus,
        to: ServiceStatus,
    },
    Started {
        pid: Option<u32>,
    },
    Stopped,
    Error {
        message: String,
    },
    /// 进程意外退出（不会自动重启）
    Exited {
        code: Option<i32>,
    },
}

impl ServiceEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            ServiceEventKind::StatusChanged { .. } => "status",
            ServiceEventKind::Started { .. } => "started",
            ServiceEventKind::Stopped => "stopped",
            ServiceEventKind::Error { .. } => "error",
            ServiceEventKind::Exited { .. } => "exited",
        }
    }
}

impl ServiceEvent {
    pub fn new(service: impl Into<String>, kind: ServiceEventKind) -> Self {
        Self {
            service: service.into(),
            kind,
        }
    }

    /// 命名空间化的通道名：service:<name>:<kind>
    pub fn topic(&self) -> String {
        format!("service:{}:{}", self.service, self.kind.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ServiceStatus; 5] = [
        ServiceStatus::Stopped,
        ServiceStatus::Starting,
        ServiceStatus::Running,
        ServiceStatus::Stopping,
        ServiceStatus::Error,
    ];

    #[test]
    fn test_only_documented_edges_are_legal() {
        let legal: Vec<(ServiceStatus, ServiceStatus)> = ALL
            .iter()
            .flat_map(|a| ALL.iter().map(move |b| (*a, *b)))
            .filter(|(a, b)| a.can_transition_to(*b))
            .collect();
        assert_eq!(legal.len(), 7);
        assert!(ServiceStatus::Running.can_transition_to(ServiceStatus::Error));
        assert!(!ServiceStatus::Error.can_transition_to(ServiceStatus::Starting));
        assert!(!ServiceStatus::Starting.can_transition_to(ServiceStatus::Stopping));
        assert!(!ServiceStatus::Stopped.can_transition_to(ServiceStatus::Stopped));
    }

    #[test]
    fn test_event_topic_is_namespaced() {
        let ev = ServiceEvent::new("automation", ServiceEventKind::Exited { code: Some(1) });
        assert_eq!(ev.topic(), "service:automation:exited");
    }

    #[test]
    fn test_config_builder_defaults() {
        let cfg = ServiceConfig::new("inference", "python3")
            .with_args(["main.py"])
            .with_env("LLM_WS_PORT", "18061");
        assert_eq!(cfg.stop_timeout, Duration::from_secs(10));
        assert_eq!(cfg.args, vec!["main.py".to_string()]);
        assert_eq!(cfg.env.get("LLM_WS_PORT").map(String::as_str), Some("18061"));
    }
}
