//! 外部服务监管：托管进程的状态机、两种服务变体与注册表

pub mod automation;
pub mod inference;
pub mod managed;
pub mod process;
pub mod status;
pub mod supervisor;

pub use automation::{automation_service, AutomationService, AutomationVariant};
pub use inference::{inference_service, InferenceService, InferenceVariant};
pub use managed::{ManagedService, ProcessService, ServiceVariant};
pub use status::{
    ServiceConfig, ServiceEndpoint, ServiceEvent, ServiceEventKind, ServiceInfo, ServiceStatus,
    META_ADDRESS, META_BASE_URL, META_EXIT_CODE,
};
pub use supervisor::Supervisor;
