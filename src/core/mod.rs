//! 核心层：错误类型与优雅关闭

pub mod error;
pub mod shutdown;

pub use error::{AgentError, ServiceError};
pub use shutdown::{
    run_with_graceful_shutdown, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason, SupervisorCleanup, WorkerCleanup,
};
