//! deskpilot - 桌面编排器
//!
//! 模块划分：
//! - **agent**: 对话历史、工具意图策略、工具调用主循环、串行请求队列
//! - **app**: 启动顺序与组件装配
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与优雅关闭
//! - **llm**: 推理服务线协议与 WebSocket 传输
//! - **observability**: 日志初始化
//! - **service**: 托管子进程的生命周期状态机与监管
//! - **tools**: MCP 客户端与工具目录

pub mod agent;
pub mod app;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod service;
pub mod tools;
