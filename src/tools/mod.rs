//! 工具桥：自动化服务的 MCP 端点 -> 模型可调用的工具目录

pub mod catalog;
pub mod mcp;

pub use catalog::{
    render_result, to_definition, ToolCatalog, ToolResult, DEFAULT_TOOL_TIMEOUT,
    MAX_TOOL_OUTPUT_CHARS,
};
pub use mcp::{McpClient, McpError, McpTool, ToolBackend};
