//! 工具目录：缓存自动化服务暴露的工具定义，并把工具调用结果归一化为模型可读文本
//!
//! call_tool 永不返回错误：失败、超时、isError 都变成 ToolResult{is_error: true}，写回对话。
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::llm::ToolDefinition;
use crate::tools::mcp::{McpError, McpTool, ToolBackend};

/// 工具输出上限（字符）
pub const MAX_TOOL_OUTPUT_CHARS: usize = 50_000;
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// 一次工具调用的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    /// 回灌给模型的文本
    pub content: String,
    /// 原始结果 JSON（失败时为错误描述）
    pub raw: Value,
    pub is_error: bool,
}

pub struct ToolCatalog {
    backend: RwLock<Arc<dyn ToolBackend>>,
    cache: RwLock<Option<Vec<ToolDefinition>>>,
    timeout: Duration,
}

impl ToolCatalog {
    pub fn new(backend: Arc<dyn ToolBackend>) -> Self {
        Self {
            backend: RwLock::new(backend),
            cache: RwLock::new(None),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// 工具定义；首次调用时从后端拉取并缓存，失败不缓存
    pub async fn definitions(&self) -> Result<Vec<ToolDefinition>, McpError> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            return Ok(cached.clone());
        }

        let backend = self.backend.read().await.clone();
        let tools = backend.list_tools().await?;
        let defs: Vec<ToolDefinition> = tools.iter().map(to_definition).collect();
        tracing::info!(count = defs.len(), "tool catalog loaded");
        *self.cache.write().await = Some(defs.clone());
        Ok(defs)
    }

    pub async fn is_cached(&self) -> bool {
        self.cache.read().await.is_some()
    }

    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// 端点变化（如自动化服务重启）时替换后端并清空缓存
    pub async fn set_backend(&self, backend: Arc<dyn ToolBackend>) {
        *self.backend.write().await = backend;
        self.invalidate().await;
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> ToolResult {
        let start = Instant::now();
        let args_preview = preview(&arguments);
        let backend = self.backend.read().await.clone();
        let result = timeout(self.timeout, backend.call_tool(name, arguments)).await;

        let (tool_result, outcome) = match result {
            Ok(Ok(raw)) => {
                let (content, is_error) = render_result(&raw);
                let outcome = if is_error { "error" } else { "ok" };
                let tool_result = ToolResult {
                    content: truncate(content),
                    raw,
                    is_error,
                };
                (tool_result, outcome)
            }
            Ok(Err(e)) => (failure(name, e.to_string()), "failed"),
            Err(_) => (
                failure(name, format!("timed out after {}s", self.timeout.as_secs())),
                "timeout",
            ),
        };

        let audit = json!({
            "event": "tool_audit",
            "tool": name,
            "ok": !tool_result.is_error,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
            "output_chars": tool_result.content.chars().count(),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        tool_result
    }
}

fn failure(name: &str, reason: String) -> ToolResult {
    tracing::warn!(tool = %name, "tool call failed: {}", reason);
    ToolResult {
        content: format!("Tool '{}' failed: {}", name, reason),
        raw: json!({ "error": reason }),
        is_error: true,
    }
}

/// MCP 工具 -> 模型可见定义；缺失 schema 用空对象 schema，空描述用工具名
pub fn to_definition(tool: &McpTool) -> ToolDefinition {
    let parameters = match &tool.input_schema {
        Some(schema @ Value::Object(_)) => schema.clone(),
        _ => json!({ "type": "object", "properties": {} }),
    };
    let description = match tool.description.as_deref().map(str::trim) {
        Some(d) if !d.is_empty() => d.to_string(),
        _ => tool.name.clone(),
    };
    ToolDefinition {
        name: tool.name.clone(),
        description,
        parameters,
    }
}

/// 结果内容：text 按行拼接，image 渲染为 `[image: <mime>]`；没有可读内容时退回原始 JSON
pub fn render_result(raw: &Value) -> (String, bool) {
    let is_error = raw.get("isError").and_then(Value::as_bool).unwrap_or(false);
    let parts: Vec<String> = raw
        .get("content")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(render_part).collect())
        .unwrap_or_default();

    let text = parts.join("\n");
    if text.trim().is_empty() {
        (raw.to_string(), is_error)
    } else {
        (text, is_error)
    }
}

fn render_part(part: &Value) -> Option<String> {
    match part.get("type").and_then(Value::as_str) {
        Some("text") => part.get("text").and_then(Value::as_str).map(str::to_string),
        Some("image") => {
            let mime = part
                .get("mimeType")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            Some(format!("[image: {}]", mime))
        }
        Some("resource") => part
            .pointer("/resource/text")
            .or_else(|| part.pointer("/resource/uri"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => Some(part.to_string()),
    }
}

fn truncate(content: String) -> String {
    let total = content.chars().count();
    if total <= MAX_TOOL_OUTPUT_CHARS {
        return content;
    }
    let kept: String = content.chars().take(MAX_TOOL_OUTPUT_CHARS).collect();
    format!(
        "{}\n\n[output truncated: {} of {} characters shown]",
        kept, MAX_TOOL_OUTPUT_CHARS, total
    )
}

fn preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
