//! Process management utilities.

mod agent;
mod control;
mod handle;
mod health;
mod manager;
mod port;
mod sweep;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use agent::{
    AgentProcessRunner, AgentRequest, AgentRun, AgentRunState, AgentStatus, AGENT_PROCESS_TAG,
};
pub use control::{force_kill, is_process_alive, kill_tree, terminate};
pub use handle::{ExitInfo, ProcessHandle, StreamKind};
pub use health::{check_health, health_client};
pub use manager::{ServiceEndpoint, ServiceProcessManager, ServiceSpec, StartReport, StartState};
pub use port::{is_port_available, PortAllocator, PortResolution};
pub use sweep::sweep_orphans;

/// Environment variable carrying the process-name tag of every spawned child.
pub const PROCESS_NAME_ENV: &str = "SUPERVISOR_PROCESS_NAME";

/// Maximum time a stop waits for the exit event before giving up.
pub const KILL_CEILING: Duration = Duration::from_secs(3);

/// Interval between readiness probes while a service starts.
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long a service may take to answer its health probe.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum time between two agent starts.
const AGENT_START_COOLDOWN: Duration = Duration::from_secs(10);

/// Upper bound for the orphan sweep on shutdown.
const SWEEP_CEILING: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Backend,
    Frontend,
}

impl ServiceKind {
    pub const ALL: [Self; 2] = [Self::Backend, Self::Frontend];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Frontend => "frontend",
        }
    }

    /// Tag passed to the child through [`PROCESS_NAME_ENV`].
    pub fn process_tag(&self) -> &'static str {
        match self {
            Self::Backend => "extension-supervisor-backend",
            Self::Frontend => "extension-supervisor-frontend",
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing knobs for service start/stop.
#[derive(Debug, Clone, Copy)]
pub struct ServiceTimings {
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub kill_ceiling: Duration,
}

impl Default for ServiceTimings {
    fn default() -> Self {
        Self {
            startup_timeout: STARTUP_TIMEOUT,
            poll_interval: HEALTH_POLL_INTERVAL,
            kill_ceiling: KILL_CEILING,
        }
    }
}

/// Timing knobs for agent runs.
#[derive(Debug, Clone, Copy)]
pub struct AgentTimings {
    pub cooldown: Duration,
    pub kill_ceiling: Duration,
}

impl Default for AgentTimings {
    fn default() -> Self {
        Self {
            cooldown: AGENT_START_COOLDOWN,
            kill_ceiling: KILL_CEILING,
        }
    }
}

pub(crate) fn sweep_ceiling() -> Duration {
    SWEEP_CEILING
}
