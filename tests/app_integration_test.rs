//! 端到端：配置 -> 服务监管 -> Agent 编排

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use deskpilot::agent::Role;
use deskpilot::app::App;
use deskpilot::config::{load_config, AppConfig};
use deskpilot::core::ShutdownManager;
use deskpilot::llm::{ScriptedTransport, ServerFrame};
use deskpilot::service::Supervisor;
use deskpilot::tools::{McpError, McpTool, ToolBackend};
use serde_json::{json, Value};

/// 记录调用的内存工具后端
#[derive(Default)]
struct RecordingBackend {
    calls: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl ToolBackend for RecordingBackend {
    async fn list_tools(&self) -> Result<Vec<McpTool>, McpError> {
        Ok(vec![McpTool {
            name: "search_feeds".into(),
            description: Some("Search notes by keyword".into()),
            input_schema: Some(json!({
                "type": "object",
                "properties": {"keyword": {"type": "string"}},
                "required": ["keyword"]
            })),
        }])
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        self.calls.lock().unwrap().push((name.to_string(), arguments));
        Ok(json!({"content": [{"type": "text", "text": "3 notes about hiking"}]}))
    }
}

#[tokio::test]
async fn test_message_flows_through_tools_and_back() {
    let transport = Arc::new(ScriptedTransport::new());
    // 第一轮：强制搜索意图下非流式返回工具调用；第二轮：流式回答
    transport
        .push(vec![
            ServerFrame::tool_call("call_a", "search_feeds", json!({"keyword": "hiking"})),
            ServerFrame::done("tool_calls"),
        ])
        .push_text("Found 3 hiking notes.");
    let backend = Arc::new(RecordingBackend::default());
    let shutdown = Arc::new(ShutdownManager::new());

    let app = App::assemble(
        AppConfig::default(),
        Arc::new(Supervisor::new()),
        backend.clone(),
        transport.clone(),
        shutdown.clone(),
    );

    let reply = app.agent().send_user_message("search hiking trails").await.unwrap();
    assert_eq!(reply, "Found 3 hiking notes.");

    let calls = backend.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![("search_feeds".to_string(), json!({"keyword": "hiking"}))]);

    let state = app.agent().snapshot();
    let roles: Vec<Role> = state.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
    assert_eq!(state.messages[2].content, "3 notes about hiking");

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools.len(), 1);
    assert!(!requests[0].config.stream);
    assert!(requests[1].config.stream);

    app.shutdown().await;
    assert!(shutdown.is_shutdown());
    assert!(app.agent().send_user_message("late").await.is_err());
}

#[cfg(unix)]
#[tokio::test]
async fn test_ordered_startup_injects_automation_address() {
    let dir = tempfile::tempdir().unwrap();
    let url_file = dir.path().join("mcp_url");
    let config_file = dir.path().join("deskpilot.toml");
    std::fs::write(
        &config_file,
        format!(
            r#"
[app]
shutdown_timeout_secs = 10

[services.automation]
program = "sh"
args = ["-c", 'echo APP_SERVER_ADDR=[::]:5555; exec sleep 30']
startup_timeout_secs = 5
health_check_interval_secs = 60
stop_timeout_secs = 2

[services.inference]
program = "sh"
args = ["-c", 'echo "$MCP_SERVER_URL" > {}; exec sleep 30']
host = "127.0.0.1"
port = 9
grace_ms = 100
retry_count = 1
retry_delay_ms = 10
health_check_interval_secs = 60
stop_timeout_secs = 2
"#,
            url_file.display()
        ),
    )
    .unwrap();

    let config = load_config(Some(config_file)).unwrap();
    let shutdown = Arc::new(ShutdownManager::new());
    let app = App::start(config, shutdown).await.unwrap();

    let status: HashMap<String, String> = app
        .status_lines()
        .await
        .into_iter()
        .map(|line| {
            let name = line.split_whitespace().next().unwrap_or_default().to_string();
            (name, line)
        })
        .collect();
    assert!(status["automation"].contains("running"), "{}", status["automation"]);
    assert!(status["automation"].contains("url=http://127.0.0.1:5555"));
    assert!(status["inference"].contains("ws=ws://127.0.0.1:9/ws"));

    let mut injected = String::new();
    for _ in 0..40 {
        injected = std::fs::read_to_string(&url_file).unwrap_or_default();
        if !injected.trim().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(injected.trim(), "http://127.0.0.1:5555");

    app.shutdown().await;
    for info in app.supervisor().all_info().await {
        assert_eq!(info.status.as_str(), "stopped", "{}", info.name);
        assert!(!info.has_process);
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_failed_startup_leaves_nothing_running() {
    let dir = tempfile::tempdir().unwrap();
    let config_file = dir.path().join("deskpilot.toml");
    std::fs::write(
        &config_file,
        r#"
[services.automation]
program = "sh"
args = ["-c", "exit 3"]
startup_timeout_secs = 2
"#,
    )
    .unwrap();

    let config = load_config(Some(config_file)).unwrap();
    let err = App::start(config, Arc::new(ShutdownManager::new()))
        .await
        .err()
        .expect("startup should fail");
    assert!(format!("{:#}", err).contains("Failed to start services"));
}
