//! 服务注册表与监管：按名称持有 ManagedService，并行启停、有序启动、事件汇聚

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{broadcast, RwLock};

use crate::core::ServiceError;
use crate::service::process::base_url_from_address;
use crate::service::{ManagedService, ServiceEvent, ServiceInfo};

const FAN_IN_CAPACITY: usize = 256;

pub struct Supervisor {
    services: RwLock<BTreeMap<String, Arc<dyn ManagedService>>>,
    events: broadcast::Sender<ServiceEvent>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(FAN_IN_CAPACITY);
        Self {
            services: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    /// 注册服务；同名重复注册被拒绝。子服务事件转发到汇聚通道
    pub async fn register(&self, service: Arc<dyn ManagedService>) -> Result<(), ServiceError> {
        let name = service.name().to_string();
        let mut services = self.services.write().await;
        if services.contains_key(&name) {
            return Err(ServiceError::DuplicateService(name));
        }

        let mut rx = service.subscribe();
        let tx = self.events.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => {
                        let _ = tx.send(ev);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("service event forwarder lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        tracing::info!(service = %name, "service registered");
        services.insert(name, service);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Arc<dyn ManagedService>, ServiceError> {
        self.services
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownService(name.to_string()))
    }

    pub async fn names(&self) -> Vec<String> {
        self.services.read().await.keys().cloned().collect()
    }

    async fn snapshot(&self) -> Vec<Arc<dyn ManagedService>> {
        self.services.read().await.values().cloned().collect()
    }

    /// 并行启动全部服务，等待全部完成后返回第一个错误
    pub async fn start_all(&self) -> Result<(), ServiceError> {
        let services = self.snapshot().await;
        let results = join_all(services.iter().map(|s| s.start())).await;
        results.into_iter().collect::<Result<Vec<_>, _>>().map(|_| ())
    }

    /// 并行停止全部服务；单个失败只记日志
    pub async fn stop_all(&self) {
        let services = self.snapshot().await;
        let results = join_all(
            services
                .iter()
                .map(|s| async move { (s.name().to_string(), s.stop().await) }),
        )
        .await;
        for (name, result) in results {
            if let Err(e) = result {
                tracing::error!(service = %name, "stop failed: {}", e);
            }
        }
        tracing::info!("all services stopped");
    }

    pub async fn start_service(&self, name: &str) -> Result<(), ServiceError> {
        self.get(name).await?.start().await
    }

    pub async fn stop_service(&self, name: &str) -> Result<(), ServiceError> {
        self.get(name).await?.stop().await
    }

    pub async fn restart_service(&self, name: &str) -> Result<(), ServiceError> {
        self.get(name).await?.restart().await
    }

    pub async fn info(&self, name: &str) -> Result<ServiceInfo, ServiceError> {
        Ok(self.get(name).await?.info())
    }

    pub async fn all_info(&self) -> Vec<ServiceInfo> {
        self.snapshot().await.iter().map(|s| s.info()).collect()
    }

    /// 有序启动：先启动 upstream，把它的 http 地址注入 downstream 的环境变量 env_key，再启动 downstream
    pub async fn start_chain(
        &self,
        upstream: &str,
        downstream: &str,
        env_key: &str,
    ) -> Result<(), ServiceError> {
        let up = self.get(upstream).await?;
        let down = self.get(downstream).await?;

        up.start().await?;
        let info = up.info();
        let address = info
            .address()
            .ok_or_else(|| ServiceError::MissingAddress(upstream.to_string()))?;
        let url = base_url_from_address(address);
        tracing::info!(upstream, downstream, %url, "injecting {}", env_key);
        down.set_env(env_key, &url);

        down.start().await
    }

    /// 所有服务事件的汇聚通道
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.events.subscribe()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::service::{ServiceEventKind, ServiceStatus, META_ADDRESS};

    /// 不拉起进程的假服务：记录调用顺序与注入的环境变量
    struct FakeService {
        name: String,
        address: Option<String>,
        fail_start: bool,
        fail_stop: bool,
        log: Arc<Mutex<Vec<String>>>,
        env: Mutex<HashMap<String, String>>,
        status: Mutex<ServiceStatus>,
        events: broadcast::Sender<ServiceEvent>,
    }

    impl FakeService {
        fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
            let (events, _) = broadcast::channel(16);
            Self {
                name: name.to_string(),
                address: None,
                fail_start: false,
                fail_stop: false,
                log,
                env: Mutex::new(HashMap::new()),
                status: Mutex::new(ServiceStatus::Stopped),
                events,
            }
        }
    }

    #[async_trait]
    impl ManagedService for FakeService {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self) -> Result<(), ServiceError> {
            let env: Vec<String> = self
                .env
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            self.log
                .lock()
                .unwrap()
                .push(format!("start {} [{}]", self.name, env.join(",")));
            if self.fail_start {
                *self.status.lock().unwrap() = ServiceStatus::Error;
                return Err(ServiceError::StartupFailed {
                    service: self.name.clone(),
                    reason: "boom".into(),
                });
            }
            *self.status.lock().unwrap() = ServiceStatus::Running;
            let _ = self.events.send(ServiceEvent::new(
                self.name.clone(),
                ServiceEventKind::Started { pid: Some(42) },
            ));
            Ok(())
        }

        async fn stop(&self) -> Result<(), ServiceError> {
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            if self.fail_stop {
                return Err(ServiceError::Stop {
                    service: self.name.clone(),
                    reason: "stuck".into(),
                });
            }
            *self.status.lock().unwrap() = ServiceStatus::Stopped;
            Ok(())
        }

        fn info(&self) -> ServiceInfo {
            let mut metadata = std::collections::BTreeMap::new();
            if let Some(addr) = &self.address {
                metadata.insert(META_ADDRESS.to_string(), addr.clone());
            }
            ServiceInfo {
                name: self.name.clone(),
                status: *self.status.lock().unwrap(),
                has_process: false,
                pid: None,
                started_at: None,
                last_error: None,
                metadata,
            }
        }

        fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
            self.events.subscribe()
        }

        fn set_env(&self, key: &str, value: &str) {
            self.env.lock().unwrap().insert(key.to_string(), value.to_string());
        }
    }

    fn log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let sup = Supervisor::new();
        let log = log();
        sup.register(Arc::new(FakeService::new("a", log.clone()))).await.unwrap();
        let err = sup
            .register(Arc::new(FakeService::new("a", log)))
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::DuplicateService("a".into()));
    }

    #[tokio::test]
    async fn test_start_chain_injects_upstream_url_before_downstream_start() {
        let sup = Supervisor::new();
        let log = log();
        let mut up = FakeService::new("automation", log.clone());
        up.address = Some("127.0.0.1:5555".into());
        sup.register(Arc::new(up)).await.unwrap();
        sup.register(Arc::new(FakeService::new("inference", log.clone())))
            .await
            .unwrap();

        sup.start_chain("automation", "inference", "MCP_SERVER_URL")
            .await
            .unwrap();

        let calls = log.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "start automation []".to_string(),
                "start inference [MCP_SERVER_URL=http://127.0.0.1:5555]".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_start_chain_without_address_fails() {
        let sup = Supervisor::new();
        let log = log();
        sup.register(Arc::new(FakeService::new("automation", log.clone())))
            .await
            .unwrap();
        sup.register(Arc::new(FakeService::new("inference", log.clone())))
            .await
            .unwrap();

        let err = sup
            .start_chain("automation", "inference", "MCP_SERVER_URL")
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::MissingAddress("automation".into()));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_all_waits_for_all_and_returns_error() {
        let sup = Supervisor::new();
        let log = log();
        let mut bad = FakeService::new("bad", log.clone());
        bad.fail_start = true;
        sup.register(Arc::new(bad)).await.unwrap();
        sup.register(Arc::new(FakeService::new("good", log.clone())))
            .await
            .unwrap();

        let err = sup.start_all().await.unwrap_err();
        assert_eq!(err.code(), "startup_failed");
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(sup.info("good").await.unwrap().status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_stop_all_tolerates_failures() {
        let sup = Supervisor::new();
        let log = log();
        let mut stuck = FakeService::new("stuck", log.clone());
        stuck.fail_stop = true;
        sup.register(Arc::new(stuck)).await.unwrap();
        sup.register(Arc::new(FakeService::new("fine", log.clone())))
            .await
            .unwrap();
        sup.start_all().await.unwrap();

        sup.stop_all().await;
        assert_eq!(sup.info("fine").await.unwrap().status, ServiceStatus::Stopped);
        let stops = log.lock().unwrap().iter().filter(|l| l.starts_with("stop")).count();
        assert_eq!(stops, 2);
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let sup = Supervisor::new();
        let err = sup.restart_service("ghost").await.unwrap_err();
        assert_eq!(err.code(), "unknown_service");
    }

    #[tokio::test]
    async fn test_child_events_are_fanned_in() {
        let sup = Supervisor::new();
        let mut rx = sup.subscribe();
        sup.register(Arc::new(FakeService::new("automation", log())))
            .await
            .unwrap();
        sup.start_service("automation").await.unwrap();

        let ev = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.topic(), "service:automation:started");
    }
}
