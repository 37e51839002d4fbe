use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_BACKEND_PORT: u16 = 3847;
pub const DEFAULT_FRONTEND_PORT: u16 = 3848;
pub const DEFAULT_AGENT_TIMEOUT_MINUTES: u64 = 45;
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;

/// Load the configuration, writing the defaults out when the file does not exist yet.
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    if !path.exists() {
        let config = SupervisorConfig::default();
        save_config(path, &config)?;
        return Ok(config);
    }
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

pub fn save_config(path: &Path, config: &SupervisorConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content)?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_true")]
    pub autostart: bool,
    /// Install directory of the extension; enables the orphan sweep on shutdown.
    #[serde(default)]
    pub extension_dir: Option<PathBuf>,
    /// Directory handed to every child as its workspace.
    #[serde(default)]
    pub workspace_dir: Option<PathBuf>,
    /// Seconds a service may take to answer its first health probe.
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    /// Extra command-line fragments identifying orphaned workers.
    #[serde(default)]
    pub sweep_markers: Vec<String>,
    #[serde(default = "ServiceConfig::backend")]
    pub backend: ServiceConfig,
    #[serde(default = "ServiceConfig::frontend")]
    pub frontend: ServiceConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

fn default_true() -> bool {
    true
}

fn default_startup_timeout() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_SECS
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            extension_dir: None,
            workspace_dir: None,
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT_SECS,
            sweep_markers: Vec::new(),
            backend: ServiceConfig::backend(),
            frontend: ServiceConfig::frontend(),
            agent: AgentConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn workspace_dir(&self) -> PathBuf {
        self.workspace_dir
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Program to launch; an empty value disables the service.
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub port: u16,
    pub health_path: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ServiceConfig {
    fn backend() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            port: DEFAULT_BACKEND_PORT,
            health_path: "/api/health".to_string(),
            env: HashMap::new(),
        }
    }

    fn frontend() -> Self {
        Self {
            program: String::new(),
            args: Vec::new(),
            port: DEFAULT_FRONTEND_PORT,
            health_path: "/health".to_string(),
            env: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.program.trim().is_empty()
    }

    /// Command-line fragment that identifies this service's workers: the
    /// first argument (usually the entry script) or else the program itself.
    pub fn marker(&self) -> Option<String> {
        let candidate = self
            .args
            .iter()
            .find(|arg| !arg.starts_with('-'))
            .unwrap_or(&self.program);
        let name = Path::new(candidate.trim()).file_name()?.to_string_lossy();
        (!name.is_empty()).then(|| name.into_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Text,
    StreamJson,
}

impl OutputFormat {
    pub fn as_arg(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::StreamJson => "stream-json",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Pre-resolved path to the automation CLI.
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Zero disables the timeout.
    #[serde(default = "default_agent_timeout")]
    pub timeout_minutes: u64,
    #[serde(default)]
    pub force_allow: bool,
    #[serde(default)]
    pub output_format: OutputFormat,
    /// Zero disables the scheduled check.
    #[serde(default)]
    pub schedule_minutes: u64,
    #[serde(default)]
    pub schedule_prompt: String,
    /// Extra environment merged over the inherited one, e.g. an API base URL override.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_agent_timeout() -> u64 {
    DEFAULT_AGENT_TIMEOUT_MINUTES
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable: None,
            timeout_minutes: DEFAULT_AGENT_TIMEOUT_MINUTES,
            force_allow: false,
            output_format: OutputFormat::Text,
            schedule_minutes: 0,
            schedule_prompt: String::new(),
            env: HashMap::new(),
        }
    }
}
