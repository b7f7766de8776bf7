//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DESKPILOT__*` 覆盖（双下划线表示嵌套，如 `DESKPILOT__LLM__MODEL=gpt-4o`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::agent::{default_system_prompt, AgentSettings, MAX_ITERATIONS};
use crate::service::{InferenceVariant, ServiceConfig};

pub const AUTOMATION: &str = "automation";
pub const INFERENCE: &str = "inference";

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub services: ServicesSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 关闭时每个清理任务的超时（秒）
    pub shutdown_timeout_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "deskpilot".to_string(),
            shutdown_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServicesSection {
    pub automation: AutomationSection,
    pub inference: InferenceSection,
}

/// 两个托管服务共有的进程参数；program/args 未设置时使用各服务的默认值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessSection {
    pub program: Option<PathBuf>,
    pub args: Option<Vec<String>>,
    pub working_dir: Option<PathBuf>,
    /// `KEY=VALUE` 形式（config 会把表的键转成小写，环境变量名需保持原样）
    pub env: Vec<String>,
    pub health_check_url: Option<String>,
    pub health_check_interval_secs: u64,
    pub startup_timeout_secs: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub stop_timeout_secs: u64,
}

impl Default for ProcessSection {
    fn default() -> Self {
        Self {
            program: None,
            args: None,
            working_dir: None,
            env: Vec::new(),
            health_check_url: None,
            health_check_interval_secs: 10,
            startup_timeout_secs: 30,
            retry_count: 3,
            retry_delay_ms: 1000,
            stop_timeout_secs: 10,
        }
    }
}

impl ProcessSection {
    fn to_service_config(&self, name: &str, program: &str, args: &[&str]) -> ServiceConfig {
        let program = self.program.clone().unwrap_or_else(|| PathBuf::from(program));
        let args = self
            .args
            .clone()
            .unwrap_or_else(|| args.iter().map(|a| a.to_string()).collect());
        let mut config = ServiceConfig::new(name, program)
            .with_args(args)
            .with_health_check_interval(Duration::from_secs(self.health_check_interval_secs))
            .with_startup_timeout(Duration::from_secs(self.startup_timeout_secs))
            .with_retry(self.retry_count, Duration::from_millis(self.retry_delay_ms))
            .with_stop_timeout(Duration::from_secs(self.stop_timeout_secs));
        if let Some(dir) = &self.working_dir {
            config = config.with_working_dir(dir.clone());
        }
        if let Some(url) = &self.health_check_url {
            config = config.with_health_check_url(url.clone());
        }
        for entry in &self.env {
            match entry.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    config = config.with_env(key.trim(), value);
                }
                _ => tracing::warn!(service = name, "ignoring malformed env entry '{}'", entry),
            }
        }
        config
    }
}

/// [services.automation] 段：端口由服务自选，就绪地址从 stdout 读取
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AutomationSection {
    #[serde(flatten)]
    pub process: ProcessSection,
}

const AUTOMATION_PROGRAM: &str = "xiaohongshu-mcp";
const AUTOMATION_ARGS: &[&str] = &["--desktop", "--port", "0"];
const INFERENCE_PROGRAM: &str = "python3";
const INFERENCE_ARGS: &[&str] = &["main.py"];

/// [services.inference] 段：固定 host/port，通过环境变量告知子进程
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceSection {
    #[serde(flatten)]
    pub process: ProcessSection,
    pub host: String,
    pub port: u16,
    /// 启动后先观察这么久，期间退出视为启动失败
    pub grace_ms: u64,
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            process: ProcessSection::default(),
            host: crate::service::inference::DEFAULT_HOST.to_string(),
            port: crate::service::inference::DEFAULT_PORT,
            grace_ms: 1500,
        }
    }
}

/// [llm] 段：模型参数，以及透传给推理服务的凭据
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub model: String,
    pub temperature: f32,
    /// 单次推理请求（WebSocket 往返）超时
    pub timeout_secs: u64,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: 0.3,
            timeout_secs: crate::llm::DEFAULT_TIMEOUT_SECS,
            api_key: None,
            base_url: None,
        }
    }
}

impl LlmSection {
    /// 未配置时回退到 OPENAI_API_KEY
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()))
    }

    /// 未配置时回退到 OPENAI_BASE_URL
    pub fn resolved_base_url(&self) -> Option<String> {
        self.base_url
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| std::env::var("OPENAI_BASE_URL").ok().filter(|u| !u.is_empty()))
    }
}

/// [agent] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 未设置时使用内置系统提示
    pub system_prompt: Option<String>,
    pub max_iterations: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_iterations: MAX_ITERATIONS,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            timeout_secs: crate::tools::DEFAULT_TOOL_TIMEOUT.as_secs(),
        }
    }
}

impl AppConfig {
    pub fn automation_service_config(&self) -> ServiceConfig {
        self.services
            .automation
            .process
            .to_service_config(AUTOMATION, AUTOMATION_PROGRAM, AUTOMATION_ARGS)
    }

    /// 推理服务配置；凭据与模型名以环境变量透传
    pub fn inference_service_config(&self) -> ServiceConfig {
        let mut config = self.services.inference.process.to_service_config(
            INFERENCE,
            INFERENCE_PROGRAM,
            INFERENCE_ARGS,
        );
        if let Some(key) = self.llm.resolved_api_key() {
            config = config.with_env("OPENAI_API_KEY", key);
        }
        if let Some(url) = self.llm.resolved_base_url() {
            config = config.with_env("OPENAI_BASE_URL", url);
        }
        config.with_env("OPENAI_MODEL", self.llm.model.clone())
    }

    pub fn inference_variant(&self) -> InferenceVariant {
        let section = &self.services.inference;
        InferenceVariant::new(section.host.clone(), section.port)
            .with_grace(Duration::from_millis(section.grace_ms))
    }

    pub fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            model: self.llm.model.clone(),
            temperature: self.llm.temperature,
            system_prompt: self
                .agent
                .system_prompt
                .clone()
                .unwrap_or_else(default_system_prompt),
            max_iterations: self.agent.max_iterations.max(1),
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_secs)
    }
}

/// 从 config 目录加载配置，环境变量 DESKPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（文件不存在时报错）
/// 3. 最后叠加环境变量 DESKPILOT__*
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DESKPILOT")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
