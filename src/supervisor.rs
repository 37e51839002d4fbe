//! Single owning object the host talks to.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::{ServiceConfig, SupervisorConfig};
use crate::error::{AppError, ErrorKind, Result};
use crate::host::{HeadlessUi, HostNotifier, HostUi, LogNotifier, LogSink, OutputSink};
use crate::paths::AGENT_COMMAND;
use crate::process::{
    sweep_ceiling, AgentProcessRunner, AgentRequest, AgentStatus, AgentTimings, ServiceKind,
    ServiceProcessManager, ServiceSpec, ServiceTimings, StartReport,
};
use crate::shutdown::{ShutdownCoordinator, ShutdownTargets};
use crate::timers::TimerRegistry;

/// Host surfaces handed to the supervisor at construction.
#[derive(Clone)]
pub struct HostBindings {
    pub sink: Arc<dyn OutputSink>,
    pub notifier: Arc<dyn HostNotifier>,
    pub ui: Arc<dyn HostUi>,
}

impl HostBindings {
    /// Log-only bindings for hosts without UI.
    pub fn headless() -> Self {
        Self {
            sink: Arc::new(LogSink),
            notifier: Arc::new(LogNotifier),
            ui: Arc::new(HeadlessUi),
        }
    }
}

/// Actual ports of the tracked services.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServicePorts {
    pub backend: Option<u16>,
    pub frontend: Option<u16>,
}

pub struct Supervisor {
    config: SupervisorConfig,
    host: HostBindings,
    services: ServiceProcessManager,
    agent: AgentProcessRunner,
    timers: TimerRegistry,
    shutdown: ShutdownCoordinator,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, host: HostBindings) -> Result<Self> {
        let service_timings = ServiceTimings {
            startup_timeout: Duration::from_secs(config.startup_timeout_secs),
            ..ServiceTimings::default()
        };
        let agent = AgentProcessRunner::new(
            Arc::clone(&host.sink),
            Arc::clone(&host.notifier),
            AgentTimings::default(),
        );

        Ok(Self {
            services: ServiceProcessManager::new(service_timings)?,
            agent,
            timers: TimerRegistry::new(),
            shutdown: ShutdownCoordinator::new(sweep_ceiling()),
            config,
            host,
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start the configured services (backend first) and the scheduled check.
    ///
    /// Each service reports its own outcome; a failure of one does not stop the other.
    pub async fn activate(&self) -> Vec<(ServiceKind, Result<StartReport>)> {
        let mut results = Vec::new();
        if self.shutdown.is_deactivated() {
            log::warn!("Activate called after deactivate, ignoring");
            return results;
        }

        if self.config.autostart {
            for kind in ServiceKind::ALL {
                if !self.service_config(kind).is_enabled() {
                    log::debug!("{} has no program configured, skipping", kind);
                    continue;
                }
                let result = self.start_service(kind).await;
                if let Err(e) = &result {
                    log::error!("Failed to start {}: {}", kind, e);
                }
                results.push((kind, result));
            }
        } else {
            log::info!("Autostart disabled, services not started");
        }

        let agent = &self.config.agent;
        if agent.schedule_minutes > 0 && !agent.schedule_prompt.trim().is_empty() {
            let every = Duration::from_secs(agent.schedule_minutes.saturating_mul(60));
            if let Err(e) = self.schedule_agent(every, agent.schedule_prompt.clone()) {
                log::warn!("Failed to schedule automation check: {}", e);
            }
        }

        results
    }

    /// Start one service. The frontend is pointed at the backend when one is tracked.
    pub async fn start_service(&self, kind: ServiceKind) -> Result<StartReport> {
        self.ensure_active()?;

        let config = self.service_config(kind);
        if !config.is_enabled() {
            return Err(AppError::config(format!("No program configured for {}", kind)));
        }

        let mut spec = ServiceSpec::from_config(kind, config, &self.config.workspace_dir());
        if kind == ServiceKind::Frontend {
            if let Some(backend_port) = self.services.get_port(ServiceKind::Backend) {
                spec.exclude_port = Some(backend_port);
                spec.env.insert(
                    "BACKEND_URL".to_string(),
                    format!("http://127.0.0.1:{}", backend_port),
                );
            }
        }

        let report = self.services.start(&spec).await?;
        if let Some(from) = report.relocated_from {
            self.host.notifier.info(&format!(
                "{} port {} is in use, relocated to port {}",
                kind, from, report.port
            ));
        }
        Ok(report)
    }

    pub async fn restart_service(&self, kind: ServiceKind) -> Result<StartReport> {
        self.ensure_active()?;
        self.services.stop(kind).await;
        self.start_service(kind).await
    }

    pub async fn stop_service(&self, kind: ServiceKind) -> bool {
        self.services.stop(kind).await
    }

    /// Run the automation CLI in the configured workspace.
    pub fn run_agent(&self, prompt: &str) -> Result<Uuid> {
        self.run_agent_in(prompt, &self.config.workspace_dir())
    }

    pub fn run_agent_in(&self, prompt: &str, workdir: &Path) -> Result<Uuid> {
        self.ensure_active()?;
        let request = AgentRequest::from_config(prompt, workdir, &self.config.agent);
        self.agent.run_in_background(request)
    }

    /// Run `prompt` every `every`. Overlaps with other runs are dropped by the
    /// agent's busy and cooldown checks.
    pub fn schedule_agent(&self, every: Duration, prompt: String) -> Result<()> {
        self.ensure_active()?;
        if every.is_zero() {
            return Err(AppError::config("Schedule interval must be positive"));
        }

        let agent = self.agent.clone();
        let request =
            AgentRequest::from_config(prompt, &self.config.workspace_dir(), &self.config.agent);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match agent.run_in_background(request.clone()) {
                    Ok(id) => log::info!("Scheduled automation check started ({})", id),
                    Err(e)
                        if matches!(e.kind(), ErrorKind::AgentBusy | ErrorKind::AgentCooldown) =>
                    {
                        log::debug!("Scheduled automation check skipped: {}", e)
                    }
                    Err(e) => log::warn!("Scheduled automation check failed: {}", e),
                }
            }
        });
        self.timers.register(task);
        log::info!(
            "Automation check scheduled every {}s ({} timer(s) active)",
            every.as_secs(),
            self.timers.len()
        );
        Ok(())
    }

    pub fn ports(&self) -> ServicePorts {
        ServicePorts {
            backend: self.services.get_port(ServiceKind::Backend),
            frontend: self.services.get_port(ServiceKind::Frontend),
        }
    }

    pub fn agent_status(&self) -> AgentStatus {
        self.agent.status()
    }

    /// Tear everything down. Only the first call does anything.
    pub async fn deactivate(&self) -> bool {
        self.shutdown
            .deactivate(ShutdownTargets {
                ui: self.host.ui.as_ref(),
                timers: &self.timers,
                services: &self.services,
                agent: &self.agent,
                extension_dir: self.config.extension_dir.clone(),
                markers: self.sweep_markers(),
            })
            .await
    }

    fn ensure_active(&self) -> Result<()> {
        if self.shutdown.is_deactivated() {
            return Err(AppError::deactivated());
        }
        Ok(())
    }

    fn service_config(&self, kind: ServiceKind) -> &ServiceConfig {
        match kind {
            ServiceKind::Backend => &self.config.backend,
            ServiceKind::Frontend => &self.config.frontend,
        }
    }

    /// Command-line fragments that identify workers spawned on our behalf.
    fn sweep_markers(&self) -> Vec<String> {
        let agent = self
            .config
            .agent
            .executable
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| AGENT_COMMAND.to_string());

        let mut markers: Vec<String> = ServiceKind::ALL
            .iter()
            .filter_map(|kind| self.service_config(*kind).marker())
            .chain(std::iter::once(agent))
            .chain(self.config.sweep_markers.iter().cloned())
            .filter(|marker| !marker.trim().is_empty())
            .collect();
        markers.sort();
        markers.dedup();
        markers
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn sweep_markers_cover_services_and_agent() {
        let mut config = SupervisorConfig::default();
        config.backend.program = "node".to_string();
        config.backend.args = vec!["dist/server.js".to_string()];
        config.frontend.program = "/usr/bin/python3".to_string();
        config.frontend.args = vec!["-m".to_string(), "http.server".to_string()];
        config.agent.executable = Some(PathBuf::from("/home/me/.claude/local/claude"));
        config.sweep_markers = vec!["server.js".to_string(), " ".to_string()];

        let supervisor = Supervisor::new(config, HostBindings::headless()).unwrap();
        assert_eq!(
            supervisor.sweep_markers(),
            vec!["claude", "http.server", "server.js"]
        );
    }

    #[tokio::test]
    async fn nothing_runs_after_deactivate() {
        let supervisor =
            Supervisor::new(SupervisorConfig::default(), HostBindings::headless()).unwrap();

        assert!(supervisor.deactivate().await);
        assert!(!supervisor.deactivate().await);

        let err = supervisor.run_agent("hello").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deactivated);
        let err = supervisor
            .start_service(ServiceKind::Backend)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Deactivated);
        assert!(supervisor.activate().await.is_empty());
        assert_eq!(supervisor.ports(), ServicePorts::default());
    }

    #[tokio::test]
    async fn disabled_service_cannot_start() {
        let supervisor =
            Supervisor::new(SupervisorConfig::default(), HostBindings::headless()).unwrap();
        let err = supervisor
            .start_service(ServiceKind::Frontend)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        supervisor.deactivate().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deactivate_stops_services_and_agent_together() {
        use std::os::unix::fs::PermissionsExt as _;

        use crate::process::{is_process_alive, AgentRunState, StartState};

        let dir = tempfile::tempdir().unwrap();
        let script = |name: &str| {
            let path = dir.path().join(name);
            let pid_file = dir.path().join(format!("{}.pid", name));
            std::fs::write(
                &path,
                format!("#!/bin/sh\necho $$ > '{}'\nexec sleep 30\n", pid_file.display()),
            )
            .unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            (path, pid_file)
        };
        let read_pid = |path: &Path| -> u32 {
            std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
        };
        let (backend, backend_pid) = script("backend.sh");
        let (agent, agent_pid) = script("agent.sh");

        let mut config = SupervisorConfig::default();
        config.workspace_dir = Some(dir.path().to_path_buf());
        config.startup_timeout_secs = 1;
        config.backend.program = backend.to_string_lossy().into_owned();
        config.backend.port = portpicker::pick_unused_port().unwrap();
        config.agent.executable = Some(agent);

        let supervisor = Supervisor::new(config, HostBindings::headless()).unwrap();
        let results = supervisor.activate().await;
        assert_eq!(results.len(), 1);
        let report = results[0].1.as_ref().unwrap();
        assert_eq!(report.state, StartState::Unconfirmed);
        assert_eq!(supervisor.ports().backend, Some(report.port));

        supervisor.run_agent("keep busy").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !agent_pid.exists() || !backend_pid.exists() {
            assert!(std::time::Instant::now() < deadline, "children did not start");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let started = std::time::Instant::now();
        assert!(supervisor.deactivate().await);
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(!is_process_alive(read_pid(&backend_pid)));
        assert!(!is_process_alive(read_pid(&agent_pid)));
        assert_eq!(supervisor.ports(), ServicePorts::default());
        let status = supervisor.agent_status();
        assert!(!status.running);
        assert_eq!(status.last.unwrap().state, AgentRunState::Cancelled);
    }

    #[derive(Default)]
    struct RecordingNotifier {
        infos: std::sync::Mutex<Vec<String>>,
    }

    impl HostNotifier for RecordingNotifier {
        fn info(&self, message: &str) {
            self.infos.lock().unwrap().push(message.to_string());
        }

        fn warn(&self, _message: &str) {}
    }

    /// Both services ask for the same port; the frontend must move and say so.
    #[cfg(unix)]
    #[tokio::test]
    async fn frontend_moves_off_backend_port_and_notifies() {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = tempfile::tempdir().unwrap();
        let script = |name: &str| {
            let path = dir.path().join(name);
            let env_file = dir.path().join(format!("{}.env", name));
            std::fs::write(
                &path,
                format!(
                    "#!/bin/sh\necho \"$PORT $BACKEND_URL\" > '{}'\nexec sleep 30\n",
                    env_file.display()
                ),
            )
            .unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            (path, env_file)
        };
        let (backend, _) = script("backend.sh");
        let (frontend, frontend_env) = script("frontend.sh");

        let shared = portpicker::pick_unused_port().unwrap();
        let mut config = SupervisorConfig::default();
        config.workspace_dir = Some(dir.path().to_path_buf());
        config.startup_timeout_secs = 1;
        config.backend.program = backend.to_string_lossy().into_owned();
        config.backend.port = shared;
        config.frontend.program = frontend.to_string_lossy().into_owned();
        config.frontend.port = shared;

        let notifier = Arc::new(RecordingNotifier::default());
        let host = HostBindings {
            notifier: notifier.clone(),
            ..HostBindings::headless()
        };
        let supervisor = Supervisor::new(config, host).unwrap();
        let results = supervisor.activate().await;
        assert_eq!(results.len(), 2);

        let ports = supervisor.ports();
        assert_eq!(ports.backend, Some(shared));
        let frontend_port = ports.frontend.unwrap();
        assert_ne!(frontend_port, shared);
        let (_, frontend_report) = results
            .iter()
            .find(|(kind, _)| *kind == ServiceKind::Frontend)
            .unwrap();
        assert_eq!(frontend_report.as_ref().unwrap().relocated_from, Some(shared));

        let infos = notifier.infos.lock().unwrap().clone();
        assert_eq!(infos.len(), 1);
        assert!(
            infos[0].contains(&format!("relocated to port {}", frontend_port)),
            "{}",
            infos[0]
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !frontend_env.exists() {
            assert!(std::time::Instant::now() < deadline, "frontend did not start");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            std::fs::read_to_string(&frontend_env).unwrap().trim(),
            format!("{} http://127.0.0.1:{}", frontend_port, shared)
        );

        supervisor.deactivate().await;
    }

    #[tokio::test]
    async fn zero_schedule_is_rejected() {
        let supervisor =
            Supervisor::new(SupervisorConfig::default(), HostBindings::headless()).unwrap();
        let err = supervisor
            .schedule_agent(Duration::ZERO, "check".to_string())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        supervisor.deactivate().await;
    }
}
