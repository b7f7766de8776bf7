//! 错误类型：服务监管（ServiceError）与 Agent 编排（AgentError）
//!
//! 工具调用失败不在此列：它们由 ToolCatalog 归一化为 ToolResult{is_error}，写回对话历史。

use thiserror::Error;

use crate::service::ServiceStatus;

/// 托管服务生命周期中的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// 进程未能启动或未在超时内发出就绪信号（不自动重试）
    #[error("Service '{service}' failed to start: {reason}")]
    StartupFailed { service: String, reason: String },

    /// 正在 Starting 时再次调用 start()
    #[error("Service '{0}' is already starting")]
    AlreadyStarting(String),

    #[error("Service '{service}': illegal transition {from:?} -> {to:?}")]
    InvalidTransition {
        service: String,
        from: ServiceStatus,
        to: ServiceStatus,
    },

    #[error("Service '{service}' health check failed: {reason}")]
    HealthCheckFailed { service: String, reason: String },

    #[error("Service '{service}' could not be spawned: {reason}")]
    Spawn { service: String, reason: String },

    #[error("Service '{service}' did not stop cleanly: {reason}")]
    Stop { service: String, reason: String },

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Service already registered: {0}")]
    DuplicateService(String),

    /// 有序启动时上游服务没有暴露监听地址
    #[error("Service '{0}' exposes no listening address")]
    MissingAddress(String),
}

impl ServiceError {
    /// 错误码，供状态对象 / 前端区分错误类别
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::StartupFailed { .. } => "startup_failed",
            ServiceError::AlreadyStarting(_) => "already_starting",
            ServiceError::InvalidTransition { .. } => "invalid_transition",
            ServiceError::HealthCheckFailed { .. } => "health_check_failed",
            ServiceError::Spawn { .. } => "spawn_failed",
            ServiceError::Stop { .. } => "stop_failed",
            ServiceError::UnknownService(_) => "unknown_service",
            ServiceError::DuplicateService(_) => "duplicate_service",
            ServiceError::MissingAddress(_) => "missing_address",
        }
    }
}

/// Agent 编排过程中终止当前请求的错误（会转为一条 assistant 错误消息）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Inference transport error: {0}")]
    Transport(String),

    #[error("Inference request timed out after {0}s")]
    Timeout(u64),

    #[error("Inference connection closed unexpectedly")]
    ConnectionClosed,

    /// 启发式判断需要工具，但模型两轮都没有调用工具
    #[error(
        "The configured model '{model}' did not call any tool although the request needs one; \
         it may not support tool calling. Please switch to a model with function-calling support."
    )]
    ToolsUnsupported { model: String },

    #[error("Reached the maximum of {0} tool-calling rounds without a final answer")]
    IterationLimit(usize),

    #[error("Agent request queue is closed")]
    QueueClosed,

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::Transport(_) => "transport_error",
            AgentError::Timeout(_) => "transport_timeout",
            AgentError::ConnectionClosed => "connection_closed",
            AgentError::ToolsUnsupported { .. } => "tools_unsupported",
            AgentError::IterationLimit(_) => "iteration_limit",
            AgentError::QueueClosed => "queue_closed",
            AgentError::Config(_) => "config_error",
        }
    }
}
