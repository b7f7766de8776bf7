//! 托管服务：状态机 + 变体能力
//!
//! ManagedService 是 Supervisor 唯一看到的接口（start / stop / restart / info）；
//! ProcessService<V> 实现通用状态机，差异部分（spawn / wait_for_ready / check_health）交给 ServiceVariant。
//! 健康检查与退出监视在各自的后台任务中运行，由每次运行独享的 CancellationToken 取消。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Child;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::core::ServiceError;
use crate::service::process::{http_check, terminate};
use crate::service::{
    ServiceConfig, ServiceEndpoint, ServiceEvent, ServiceEventKind, ServiceInfo, ServiceStatus,
    META_ADDRESS, META_BASE_URL, META_EXIT_CODE,
};

/// 单次健康探测的超时
pub(crate) const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// 退出监视的轮询间隔
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const EVENT_CAPACITY: usize = 64;

/// Supervisor 持有的服务接口（不关心具体变体）
#[async_trait]
pub trait ManagedService: Send + Sync {
    fn name(&self) -> &str;

    /// Running 时为 no-op；Starting 时报错
    async fn start(&self) -> Result<(), ServiceError>;

    /// Stopped 时为 no-op；并发调用只有第一个执行终止，其余等待完成
    async fn stop(&self) -> Result<(), ServiceError>;

    async fn restart(&self) -> Result<(), ServiceError> {
        self.stop().await?;
        self.start().await
    }

    fn info(&self) -> ServiceInfo;

    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent>;

    /// 追加环境变量，下次 spawn 时生效（有序启动时注入上游地址）
    fn set_env(&self, key: &str, value: &str);
}

/// 变体能力：如何拉起进程、如何判断就绪、如何探测健康
#[async_trait]
pub trait ServiceVariant: Send + Sync + 'static {
    fn spawn(&self, config: &ServiceConfig, env: &HashMap<String, String>) -> std::io::Result<Child>;

    /// 阻塞直到进程报告监听地址（或宽限期结束）；外层施加 startup_timeout
    async fn wait_for_ready(
        &self,
        config: &ServiceConfig,
        child: &mut Child,
    ) -> Result<ServiceEndpoint, String>;

    async fn check_health(&self, endpoint: &ServiceEndpoint) -> Result<(), String>;
}

#[derive(Debug, Default)]
struct RuntimeState {
    status: ServiceStatus,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    endpoint: Option<ServiceEndpoint>,
    exit_code: Option<i32>,
    injected_env: HashMap<String, String>,
    run_token: Option<CancellationToken>,
}

/// 状态机共享部分：后台任务与 ProcessService 共同持有
struct Shared {
    name: String,
    state: StdMutex<RuntimeState>,
    status_tx: watch::Sender<ServiceStatus>,
    events: broadcast::Sender<ServiceEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, kind: ServiceEventKind) {
        let _ = self.events.send(ServiceEvent::new(self.name.clone(), kind));
    }

    /// 在持锁状态下迁移；非法边返回 InvalidTransition
    fn transition_locked(
        &self,
        st: &mut RuntimeState,
        to: ServiceStatus,
    ) -> Result<(), ServiceError> {
        let from = st.status;
        if !from.can_transition_to(to) {
            return Err(ServiceError::InvalidTransition {
                service: self.name.clone(),
                from,
                to,
            });
        }
        st.status = to;
        self.status_tx.send_replace(to);
        tracing::info!(service = %self.name, "{} -> {}", from, to);
        self.emit(ServiceEventKind::StatusChanged { from, to });
        Ok(())
    }

    /// 仅当当前为 Running 时转为 Error（健康检查失败）
    fn fail_running(&self, message: String) -> bool {
        let mut st = self.lock();
        if st.status != ServiceStatus::Running {
            return false;
        }
        st.last_error = Some(message.clone());
        if self.transition_locked(&mut st, ServiceStatus::Error).is_err() {
            return false;
        }
        drop(st);
        self.emit(ServiceEventKind::Error { message });
        true
    }

    /// 子进程已被回收：Running / Error 下都清掉 pid、记录退出码并发 Exited；
    /// 只有 Running 需要迁移到 Error。Stopping / Stopped 由 stop() 自己收尾
    fn record_exit(&self, message: String, code: Option<i32>) {
        let mut st = self.lock();
        if !matches!(st.status, ServiceStatus::Running | ServiceStatus::Error) {
            return;
        }
        st.pid = None;
        st.exit_code = code;
        self.emit(ServiceEventKind::Exited { code });

        let failed = st.status == ServiceStatus::Running
            && self.transition_locked(&mut st, ServiceStatus::Error).is_ok();
        if failed {
            st.last_error = Some(message.clone());
        }
        drop(st);
        if failed {
            self.emit(ServiceEventKind::Error { message });
        }
    }
}

/// 通用进程服务：状态机 + 子进程句柄（独占），变体只提供差异能力
pub struct ProcessService<V: ServiceVariant> {
    config: ServiceConfig,
    variant: Arc<V>,
    shared: Arc<Shared>,
    child: Arc<Mutex<Option<Child>>>,
    http: reqwest::Client,
}

impl<V: ServiceVariant> ProcessService<V> {
    pub fn new(config: ServiceConfig, variant: V) -> Self {
        let (status_tx, _) = watch::channel(ServiceStatus::Stopped);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let http = reqwest::Client::builder()
            .timeout(HEALTH_CHECK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            shared: Arc::new(Shared {
                name: config.name.clone(),
                state: StdMutex::new(RuntimeState::default()),
                status_tx,
                events,
            }),
            config,
            variant: Arc::new(variant),
            child: Arc::new(Mutex::new(None)),
            http,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn status(&self) -> ServiceStatus {
        self.shared.lock().status
    }

    /// 就绪后可用的端点
    pub fn endpoint(&self) -> Option<ServiceEndpoint> {
        self.shared.lock().endpoint.clone()
    }

    /// 状态变化的 watch 通道（测试与 UI 可等待特定状态）
    pub fn watch_status(&self) -> watch::Receiver<ServiceStatus> {
        self.shared.status_tx.subscribe()
    }

    async fn launch(&self) -> Result<(), ServiceError> {
        let env = {
            let st = self.shared.lock();
            let mut env = self.config.env.clone();
            env.extend(st.injected_env.iter().map(|(k, v)| (k.clone(), v.clone())));
            env
        };

        let mut child = self
            .variant
            .spawn(&self.config, &env)
            .map_err(|e| ServiceError::Spawn {
                service: self.config.name.clone(),
                reason: e.to_string(),
            })?;
        let pid = child.id();
        self.shared.lock().pid = pid;
        tracing::info!(service = %self.config.name, pid, "process spawned");

        let ready = tokio::time::timeout(
            self.config.startup_timeout,
            self.variant.wait_for_ready(&self.config, &mut child),
        )
        .await;
        let endpoint = match ready {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(reason)) => {
                let _ = child.kill().await;
                return Err(ServiceError::StartupFailed {
                    service: self.config.name.clone(),
                    reason,
                });
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(ServiceError::StartupFailed {
                    service: self.config.name.clone(),
                    reason: format!(
                        "no readiness signal within {:?}",
                        self.config.startup_timeout
                    ),
                });
            }
        };

        *self.child.lock().await = Some(child);

        let token = CancellationToken::new();
        self.spawn_health_loop(endpoint.clone(), token.clone());
        self.spawn_exit_monitor(token.clone());

        {
            let mut st = self.shared.lock();
            st.endpoint = Some(endpoint.clone());
            st.started_at = Some(Utc::now());
            st.exit_code = None;
            st.run_token = Some(token);
            self.shared.transition_locked(&mut st, ServiceStatus::Running)?;
        }
        tracing::info!(
            service = %self.config.name,
            address = %endpoint.address,
            "service is running"
        );
        self.shared.emit(ServiceEventKind::Started { pid });
        Ok(())
    }

    fn spawn_health_loop(&self, endpoint: ServiceEndpoint, token: CancellationToken) {
        let shared = Arc::clone(&self.shared);
        let variant = Arc::clone(&self.variant);
        let http = self.http.clone();
        let override_url = self.config.health_check_url.clone();
        let period = self.config.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if shared.lock().status != ServiceStatus::Running {
                    break;
                }
                let check = async {
                    match &override_url {
                        Some(url) => http_check(&http, url).await,
                        None => variant.check_health(&endpoint).await,
                    }
                };
                let outcome = match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, check).await {
                    Ok(result) => result,
                    Err(_) => Err(format!("health check timed out after {:?}", HEALTH_CHECK_TIMEOUT)),
                };
                match outcome {
                    Ok(()) => tracing::debug!(service = %shared.name, "health check ok"),
                    Err(reason) => {
                        tracing::warn!(service = %shared.name, "health check failed: {}", reason);
                        let err = ServiceError::HealthCheckFailed {
                            service: shared.name.clone(),
                            reason,
                        };
                        shared.fail_running(err.to_string());
                        break;
                    }
                }
            }
        });
    }

    fn spawn_exit_monitor(&self, token: CancellationToken) {
        let shared = Arc::clone(&self.shared);
        let child = Arc::clone(&self.child);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(EXIT_POLL_INTERVAL) => {}
                }
                let mut guard = child.lock().await;
                let Some(proc_) = guard.as_mut() else { break };
                match proc_.try_wait() {
                    Ok(Some(status)) => {
                        guard.take();
                        drop(guard);
                        if token.is_cancelled() {
                            break;
                        }
                        tracing::error!(service = %shared.name, "process exited unexpectedly: {}", status);
                        shared.record_exit(
                            format!("process exited unexpectedly ({})", status),
                            status.code(),
                        );
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!(service = %shared.name, "try_wait failed: {}", e),
                }
            }
        });
    }
}

#[async_trait]
impl<V: ServiceVariant> ManagedService for ProcessService<V> {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn start(&self) -> Result<(), ServiceError> {
        {
            let mut st = self.shared.lock();
            match st.status {
                ServiceStatus::Running => return Ok(()),
                ServiceStatus::Starting => {
                    return Err(ServiceError::AlreadyStarting(self.config.name.clone()))
                }
                _ => {}
            }
            self.shared.transition_locked(&mut st, ServiceStatus::Starting)?;
            st.last_error = None;
        }

        match self.launch().await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::error!(service = %self.config.name, "{}", err);
                {
                    let mut st = self.shared.lock();
                    st.last_error = Some(err.to_string());
                    st.pid = None;
                    let _ = self.shared.transition_locked(&mut st, ServiceStatus::Error);
                }
                self.shared.emit(ServiceEventKind::Error {
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        let token = {
            let mut st = self.shared.lock();
            match st.status {
                ServiceStatus::Stopped => return Ok(()),
                ServiceStatus::Stopping => None,
                _ => {
                    self.shared.transition_locked(&mut st, ServiceStatus::Stopping)?;
                    Some(st.run_token.take())
                }
            }
        };

        let Some(token) = token else {
            // 另一个调用方正在终止进程，等待其完成
            let mut rx = self.shared.status_tx.subscribe();
            let _ = rx.wait_for(|s| *s != ServiceStatus::Stopping).await;
            return Ok(());
        };

        if let Some(token) = token {
            token.cancel();
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match terminate(&mut child, self.config.stop_timeout).await {
                Ok(status) => {
                    tracing::info!(service = %self.config.name, "process terminated: {}", status);
                    self.shared.lock().exit_code = status.code();
                }
                Err(reason) => {
                    let err = ServiceError::Stop {
                        service: self.config.name.clone(),
                        reason,
                    };
                    tracing::warn!(service = %self.config.name, "{}", err);
                    self.shared.lock().last_error = Some(err.to_string());
                }
            }
        }

        {
            let mut st = self.shared.lock();
            st.pid = None;
            st.endpoint = None;
            st.started_at = None;
            self.shared.transition_locked(&mut st, ServiceStatus::Stopped)?;
        }
        self.shared.emit(ServiceEventKind::Stopped);
        Ok(())
    }

    fn info(&self) -> ServiceInfo {
        let st = self.shared.lock();
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("program".to_string(), self.config.program.display().to_string());
        if let Some(ep) = &st.endpoint {
            metadata.insert(META_ADDRESS.to_string(), ep.address.clone());
            metadata.insert(META_BASE_URL.to_string(), ep.base_url.clone());
            metadata.extend(ep.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(code) = st.exit_code {
            metadata.insert(META_EXIT_CODE.to_string(), code.to_string());
        }
        ServiceInfo {
            name: self.config.name.clone(),
            status: st.status,
            has_process: st.pid.is_some(),
            pid: st.pid,
            started_at: st.started_at,
            last_error: st.last_error.clone(),
            metadata,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.shared.events.subscribe()
    }

    fn set_env(&self, key: &str, value: &str) {
        self.shared
            .lock()
            .injected_env
            .insert(key.to_string(), value.to_string());
    }
}
