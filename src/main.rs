//! deskpilot 入口
//!
//! 初始化日志与配置，按顺序启动自动化服务与推理服务，然后运行控制台对话循环。
//! 命令：/reset 清空会话，/status 查看服务状态，/restart <name> 重启服务，/quit 退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use deskpilot::agent::{AgentEvent, AgentHandle};
use deskpilot::app::App;
use deskpilot::config::load_config;
use deskpilot::core::{run_with_graceful_shutdown, ShutdownManager, ShutdownReason};
use deskpilot::observability;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let shutdown = Arc::new(ShutdownManager::new());
    let app = App::start(config, shutdown.clone())
        .await
        .context("Failed to start deskpilot")?;

    let printer = spawn_printer(app.agent().clone());

    run_with_graceful_shutdown(shutdown.clone(), repl(&app, &shutdown), || async {
        app.shutdown().await;
    })
    .await;

    printer.abort();
    Ok(())
}

async fn repl(app: &App, shutdown: &ShutdownManager) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let _ = stdout.write_all(b"> ").await;
        let _ = stdout.flush().await;

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("stdin read failed: {}", e);
                break;
            }
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input.split_once(' ').unwrap_or((input, "")) {
            ("/quit", _) | ("/exit", _) => break,
            ("/reset", _) => {
                if let Err(e) = app.agent().reset().await {
                    println!("[error] {}", e);
                }
            }
            ("/status", _) => {
                for line in app.status_lines().await {
                    println!("{}", line);
                }
            }
            ("/restart", name) if !name.trim().is_empty() => {
                match app.restart_service(name.trim()).await {
                    Ok(()) => println!("{} restarted", name.trim()),
                    Err(e) => println!("[error] {:#}", e),
                }
            }
            ("/restart", _) => println!("usage: /restart <automation|inference>"),
            _ => {
                // 回复由 printer 渲染，这里只等待处理结束
                let _ = app.agent().send_user_message(input).await;
            }
        }
    }

    shutdown.shutdown(ShutdownReason::UserInitiated);
}

/// 订阅 Agent 事件并渲染：流式增量直接输出；非流式的最终回复从快照中取
fn spawn_printer(agent: AgentHandle) -> tokio::task::JoinHandle<()> {
    let mut events = agent.subscribe();
    tokio::spawn(async move {
        let mut streamed = false;
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match event {
                AgentEvent::ContentDelta { text, .. } => {
                    streamed = true;
                    print!("{}", text);
                    let _ = std::io::Write::flush(&mut std::io::stdout());
                }
                AgentEvent::ToolCallStarted { tool, arguments, .. } => {
                    println!("[tool] {} {}", tool, arguments);
                }
                AgentEvent::ToolCallFinished { tool, is_error, .. } if is_error => {
                    println!("[tool] {} failed", tool);
                }
                AgentEvent::Completed { message_id } => {
                    if streamed {
                        println!();
                    } else if let Some(msg) = agent.snapshot().get(&message_id) {
                        println!("{}", msg.content);
                    }
                    streamed = false;
                }
                AgentEvent::Error { code, message } => {
                    if streamed {
                        println!();
                    }
                    println!("[error:{}] {}", code, message);
                    streamed = false;
                }
                _ => {}
            }
        }
    })
}
