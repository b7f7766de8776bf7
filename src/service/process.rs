//! 子进程工具：命令构建、输出转发、就绪地址解析、健康探测、优雅终止

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};

use crate::service::ServiceConfig;

/// 构建带配置参数与环境的命令：stdin 关闭，stdout/stderr 管道化，句柄丢弃时杀进程
pub fn base_command(config: &ServiceConfig, env: &HashMap<String, String>) -> Command {
    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    cmd
}

/// 后台逐行转发子进程输出到日志（避免管道写满阻塞子进程）
pub fn forward_lines<R>(service: String, stream: &'static str, mut lines: Lines<R>)
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => tracing::debug!(service = %service, stream, "{}", line),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(service = %service, stream, "output closed: {}", e);
                    break;
                }
            }
        }
    });
}

pub fn forward_output<R>(service: &str, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    forward_lines(service.to_string(), stream, BufReader::new(reader).lines());
}

/// 解析就绪行，如 `APP_SERVER_ADDR=127.0.0.1:5555`
pub fn parse_ready_line<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let value = line.trim().strip_prefix(prefix)?.trim();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// 通配地址归一化为回环地址；去掉 IPv6 方括号
pub fn normalize_host(host: &str) -> &str {
    match host {
        "" | "0.0.0.0" | "::" | "[::]" => "127.0.0.1",
        h if h.starts_with('[') && h.ends_with(']') => &h[1..h.len() - 1],
        h => h,
    }
}

/// host:port -> 可连接的 host:port（IPv6 带方括号）
pub fn normalize_address(addr: &str) -> String {
    match addr.rsplit_once(':') {
        Some((host, port)) => {
            let host = normalize_host(host);
            if host.contains(':') {
                format!("[{}]:{}", host, port)
            } else {
                format!("{}:{}", host, port)
            }
        }
        None => addr.to_string(),
    }
}

/// host:port -> http://host:port
pub fn base_url_from_address(addr: &str) -> String {
    format!("http://{}", normalize_address(addr))
}

pub fn health_url(base_url: &str) -> String {
    format!("{}/health", base_url.trim_end_matches('/'))
}

/// GET url，2xx 视为健康
pub async fn http_check(client: &reqwest::Client, url: &str) -> Result<(), String> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("GET {} failed: {}", url, e))?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(format!("GET {} returned {}", url, resp.status()))
    }
}

/// 先发 SIGTERM（unix），在 timeout 内等待退出，否则强杀
pub async fn terminate(child: &mut Child, timeout: Duration) -> Result<ExitStatus, String> {
    if let Ok(Some(status)) = child.try_wait() {
        return Ok(status);
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!(pid, "SIGTERM failed: {}", e);
            }
        }
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => Ok(status),
        Ok(Err(e)) => Err(format!("wait failed: {}", e)),
        Err(_) => {
            tracing::warn!(
                pid = child.id(),
                "process did not exit within {:?}, killing",
                timeout
            );
            child.kill().await.map_err(|e| format!("kill failed: {}", e))?;
            child.wait().await.map_err(|e| format!("wait failed: {}", e))
        }
    }
}
