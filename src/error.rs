//! Supervisor error types.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// Supervisor error that can be serialized for the host.
#[derive(Debug)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Network error
    Network,
    /// Process control error
    Process,
    /// No free port left in the scan range
    PortUnavailable,
    /// Executable for a child process could not be found
    BinaryNotFound,
    /// An agent run is already in progress
    AgentBusy,
    /// An agent run was started too recently
    AgentCooldown,
    /// Supervisor has already been deactivated
    Deactivated,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::Config => 2001,
            Self::Io => 2002,
            Self::Network => 2003,
            Self::Process => 3003,
            Self::PortUnavailable => 3004,
            Self::BinaryNotFound => 3006,
            Self::AgentBusy => 3101,
            Self::AgentCooldown => 3102,
            Self::Deactivated => 3201,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Network, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn port_unavailable(desired: u16, scan_start: u16, scan_end: u16) -> Self {
        Self::new(
            ErrorKind::PortUnavailable,
            HashMap::from([
                ("port".to_string(), desired.to_string()),
                ("range".to_string(), format!("{}-{}", scan_start, scan_end)),
            ]),
        )
    }

    pub fn binary_not_found(program: &str) -> Self {
        Self::new(
            ErrorKind::BinaryNotFound,
            HashMap::from([("program".to_string(), program.to_string())]),
        )
    }

    pub fn agent_busy(run_id: &str) -> Self {
        Self::new(
            ErrorKind::AgentBusy,
            HashMap::from([("run".to_string(), run_id.to_string())]),
        )
    }

    pub fn agent_cooldown(remaining_secs: u64) -> Self {
        Self::new(
            ErrorKind::AgentCooldown,
            HashMap::from([("retry_after".to_string(), format!("{}s", remaining_secs))]),
        )
    }

    pub fn deactivated() -> Self {
        Self::new(ErrorKind::Deactivated, HashMap::new())
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
