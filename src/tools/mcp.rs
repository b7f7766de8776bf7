//! MCP 客户端：JSON-RPC 2.0 over HTTP POST `<base>/mcp`
//!
//! 首次调用前惰性完成 `initialize` + `notifications/initialized` 握手；
//! 服务端返回的 `Mcp-Session-Id` 之后每个请求都带上。响应体可能是 JSON，也可能是 SSE（`data:` 行）。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;

use super::catalog::DEFAULT_TOOL_TIMEOUT;

pub const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum McpError {
    #[error("MCP HTTP request failed: {0}")]
    Http(String),

    #[error("MCP endpoint returned HTTP {0}")]
    Status(u16),

    #[error("MCP error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("MCP protocol error: {0}")]
    Protocol(String),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// `tools/list` 返回的单个工具
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<Value>,
}

/// 工具目录的后端：列出工具、调用工具（返回原始结果 JSON）
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpTool>, McpError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError>;
}

#[derive(Debug, Default)]
struct Session {
    initialized: bool,
    id: Option<String>,
}

pub struct McpClient {
    endpoint: String,
    http: reqwest::Client,
    session: Mutex<Session>,
    next_id: AtomicU64,
}

impl McpClient {
    /// base_url 形如 `http://127.0.0.1:5555`
    pub fn new(base_url: &str) -> Self {
        Self {
            endpoint: format!("{}/mcp", base_url.trim_end_matches('/')),
            http: http_client(DEFAULT_TOOL_TIMEOUT),
            session: Mutex::new(Session::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// 单次 HTTP 请求的超时，应与工具目录的调用超时一致
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http = http_client(timeout);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session.lock().await.id.clone()
    }

    /// 丢弃会话，下次调用重新握手
    pub async fn reset_session(&self) {
        tracing::info!(endpoint = %self.endpoint, "resetting MCP session");
        *self.session.lock().await = Session::default();
    }

    async fn post(
        &self,
        payload: &Value,
        session_id: Option<&str>,
    ) -> Result<(Option<String>, Option<Value>), McpError> {
        let mut req = self
            .http
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(payload);
        if let Some(id) = session_id {
            req = req.header("Mcp-Session-Id", id);
        }

        let resp = req.send().await.map_err(|e| McpError::Http(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(McpError::Status(status.as_u16()));
        }

        let sid = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let is_sse = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = resp.text().await.map_err(|e| McpError::Http(e.to_string()))?;
        if body.trim().is_empty() {
            return Ok((sid, None));
        }
        let value = if is_sse {
            parse_sse(&body)?
        } else {
            serde_json::from_str(&body)
                .map_err(|e| McpError::Protocol(format!("invalid JSON body: {}", e)))?
        };
        Ok((sid, Some(value)))
    }

    fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            method: method.to_string(),
            params,
        };
        serde_json::to_value(req).map_err(|e| McpError::Protocol(e.to_string()))
    }

    /// 握手（仅一次）；返回会话 ID
    async fn ensure_initialized(&self) -> Result<Option<String>, McpError> {
        let mut session = self.session.lock().await;
        if session.initialized {
            return Ok(session.id.clone());
        }

        let payload = self.request(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "clientInfo": { "name": "deskpilot", "version": env!("CARGO_PKG_VERSION") }
            })),
        )?;
        let (sid, body) = self.post(&payload, None).await?;
        if let Some(body) = body {
            into_result(body)?;
        }
        match &sid {
            Some(id) => tracing::info!(session = %id, "MCP session established"),
            None => tracing::warn!("MCP server returned no session id"),
        }

        let notification = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
        self.post(&notification, sid.as_deref()).await?;

        session.initialized = true;
        session.id = sid.clone();
        Ok(sid)
    }

    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let sid = self.ensure_initialized().await?;
        let payload = self.request(method, params)?;
        let (_, body) = self.post(&payload, sid.as_deref()).await?;
        let body = body.ok_or_else(|| McpError::Protocol(format!("empty response to {}", method)))?;
        into_result(body)
    }
}

#[async_trait]
impl ToolBackend for McpClient {
    async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        let result = self.call("tools/list", None).await?;
        let tools = result
            .get("tools")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| serde_json::from_value(t.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.call(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }
}

/// JSON-RPC 响应 -> result；error 字段转为 McpError::Rpc
fn into_result(body: Value) -> Result<Value, McpError> {
    let resp: JsonRpcResponse =
        serde_json::from_value(body).map_err(|e| McpError::Protocol(e.to_string()))?;
    if let Some(err) = resp.error {
        return Err(McpError::Rpc {
            code: err.get("code").and_then(Value::as_i64).unwrap_or(-1),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    Ok(resp.result.unwrap_or_else(|| json!({})))
}

/// SSE 响应体：取最后一个可解析为 JSON-RPC 响应的 `data:` 负载
fn parse_sse(body: &str) -> Result<Value, McpError> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
        .filter(|v| v.get("result").is_some() || v.get("error").is_some())
        .last()
        .ok_or_else(|| McpError::Protocol("no JSON-RPC message in event stream".to_string()))
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod fake {
    //! 测试用假自动化服务：/health 与 /mcp（会话校验、SSE 响应）

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    pub const SESSION: &str = "sess-42";

    #[derive(Default)]
    pub struct FakeMcp {
        pub initializations: AtomicUsize,
        pub calls: AtomicUsize,
    }

    async fn mcp(
        State(state): State<Arc<FakeMcp>>,
        headers: HeaderMap,
        Json(req): Json<Value>,
    ) -> Response {
        let method = req["method"].as_str().unwrap_or_default().to_string();
        let id = req.get("id").cloned().unwrap_or(Value::Null);

        if method == "initialize" {
            state.initializations.fetch_add(1, Ordering::SeqCst);
            let body = json!({"jsonrpc": "2.0", "id": id, "result": {"protocolVersion": "2024-11-05"}});
            return ([("mcp-session-id", SESSION)], Json(body)).into_response();
        }
        if headers.get("mcp-session-id").and_then(|v| v.to_str().ok()) != Some(SESSION) {
            return StatusCode::BAD_REQUEST.into_response();
        }
        if method == "notifications/initialized" {
            return StatusCode::ACCEPTED.into_response();
        }

        match method.as_str() {
            "tools/list" => Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"tools": [
                    {"name": "search_feeds", "description": "搜索内容", "inputSchema": {
                        "type": "object",
                        "properties": {"keyword": {"type": "string"}},
                        "required": ["keyword"]
                    }},
                    {"name": "list_feeds", "description": ""},
                    {"name": "check_login_status"}
                ]}
            }))
            .into_response(),
            "tools/call" => {
                state.calls.fetch_add(1, Ordering::SeqCst);
                let name = req["params"]["name"].as_str().unwrap_or_default();
                let args = req["params"]["arguments"].clone();
                match name {
                    "search_feeds" => {
                        let body = json!({"jsonrpc": "2.0", "id": id, "result": {"content": [
                            {"type": "text", "text": format!("results for {}", args["keyword"].as_str().unwrap_or(""))}
                        ]}});
                        // 以 SSE 形式返回
                        let sse = format!("event: message\ndata: {}\n\n", body);
                        ([("content-type", "text/event-stream")], sse).into_response()
                    }
                    "list_feeds" => Json(json!({"jsonrpc": "2.0", "id": id, "result": {"content": [
                        {"type": "text", "text": "feed 1"},
                        {"type": "image", "data": "AAAA", "mimeType": "image/png"},
                        {"type": "text", "text": "feed 2"}
                    ]}}))
                    .into_response(),
                    "slow_search" => {
                        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
                        Json(json!({"jsonrpc": "2.0", "id": id, "result": {"content": [
                            {"type": "text", "text": "slow results"}
                        ]}}))
                        .into_response()
                    }
                    "check_login_status" => Json(json!({"jsonrpc": "2.0", "id": id, "result": {
                        "content": [{"type": "text", "text": "not logged in"}],
                        "isError": true
                    }}))
                    .into_response(),
                    _ => Json(json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32602, "message": format!("unknown tool {}", name)}}))
                        .into_response(),
                }
            }
            _ => Json(json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "method not found"}}))
                .into_response(),
        }
    }

    /// 在随机端口启动，返回 (base_url, 状态)
    pub async fn spawn() -> (String, Arc<FakeMcp>) {
        let state = Arc::new(FakeMcp::default());
        let app = Router::new()
            .route("/health", get(|| async { "OK" }))
            .route("/mcp", post(mcp))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{}", addr), state)
    }
}
