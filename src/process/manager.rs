//! Long-lived service process tracking.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures_util::future::join_all;
use reqwest::Client;
use serde::Serialize;
use tokio::process::Command;
use tokio::time::Instant;

use super::control::{prepare_command, terminate};
use super::handle::{ExitCallback, ExitInfo, ProcessHandle, StreamKind};
use super::health::{check_health, health_client};
use super::port::PortAllocator;
use super::{ServiceKind, ServiceTimings, PROCESS_NAME_ENV};
use crate::config::{ServiceConfig, DEFAULT_BACKEND_PORT, DEFAULT_FRONTEND_PORT};
use crate::error::{AppError, Result};

/// Everything needed to start one service.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub kind: ServiceKind,
    pub program: String,
    pub args: Vec<String>,
    pub desired_port: u16,
    /// Fixed point the relocation scan starts from.
    pub scan_start: u16,
    /// Port already claimed by another service in the same startup pass.
    pub exclude_port: Option<u16>,
    pub health_path: String,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
}

impl ServiceSpec {
    pub fn from_config(kind: ServiceKind, config: &ServiceConfig, working_dir: &Path) -> Self {
        let scan_start = match kind {
            ServiceKind::Backend => DEFAULT_BACKEND_PORT,
            ServiceKind::Frontend => DEFAULT_FRONTEND_PORT,
        };
        Self {
            kind,
            program: config.program.clone(),
            args: config.args.clone(),
            desired_port: config.port,
            scan_start,
            exclude_port: None,
            health_path: config.health_path.clone(),
            working_dir: working_dir.to_path_buf(),
            env: config.env.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartState {
    /// Health probe succeeded (or an existing instance was reused).
    Ready,
    /// Health probe never succeeded before the startup timeout; the process keeps running.
    Unconfirmed,
    /// The process exited while starting up.
    Exited,
}

/// Read-only result of a start request.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StartReport {
    pub kind: ServiceKind,
    pub port: u16,
    pub reused: bool,
    pub relocated_from: Option<u16>,
    pub state: StartState,
}

/// One tracked logical service.
#[derive(Debug)]
pub struct ServiceEndpoint {
    pub kind: ServiceKind,
    pub desired_port: u16,
    pub port: u16,
    pub reused: bool,
    generation: u64,
    handle: Option<ProcessHandle>,
}

impl ServiceEndpoint {
    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(ProcessHandle::pid)
    }
}

type EndpointMap = Arc<RwLock<HashMap<ServiceKind, ServiceEndpoint>>>;

/// Manages the backend and frontend processes.
pub struct ServiceProcessManager {
    endpoints: EndpointMap,
    generations: AtomicU64,
    http_client: Client,
    ports: PortAllocator,
    timings: ServiceTimings,
}

impl ServiceProcessManager {
    pub fn new(timings: ServiceTimings) -> Result<Self> {
        Ok(Self {
            endpoints: Arc::new(RwLock::new(HashMap::new())),
            generations: AtomicU64::new(1),
            http_client: health_client()?,
            ports: PortAllocator::default(),
            timings,
        })
    }

    /// Get the actual port of a tracked service.
    pub fn get_port(&self, kind: ServiceKind) -> Option<u16> {
        let endpoints = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
        endpoints.get(&kind).map(|endpoint| endpoint.port)
    }

    pub fn is_tracked(&self, kind: ServiceKind) -> bool {
        let endpoints = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
        endpoints.contains_key(&kind)
    }

    pub fn get_tracked_kinds(&self) -> Vec<ServiceKind> {
        let endpoints = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
        let mut kinds: Vec<ServiceKind> = endpoints.keys().copied().collect();
        kinds.sort();
        kinds
    }

    fn is_generation_tracked(&self, kind: ServiceKind, generation: u64) -> bool {
        let endpoints = self.endpoints.read().unwrap_or_else(|e| e.into_inner());
        endpoints
            .get(&kind)
            .is_some_and(|endpoint| endpoint.generation == generation)
    }

    /// Start a service, replacing any endpoint already tracked for its kind.
    ///
    /// A startup that is never confirmed by the health probe is reported as
    /// [`StartState::Unconfirmed`] and the process is left running.
    pub async fn start(&self, spec: &ServiceSpec) -> Result<StartReport> {
        if self.is_tracked(spec.kind) {
            log::info!("Replacing running {} before start", spec.kind);
            self.stop(spec.kind).await;
        }

        let client = self.http_client.clone();
        let health_path = spec.health_path.clone();
        let resolution = self
            .ports
            .resolve(
                spec.desired_port,
                spec.scan_start,
                spec.exclude_port,
                |port| async move { check_health(&client, port, &health_path).await },
            )
            .await?;

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let port = resolution.port;

        if resolution.reused {
            let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
            endpoints.insert(
                spec.kind,
                ServiceEndpoint {
                    kind: spec.kind,
                    desired_port: spec.desired_port,
                    port,
                    reused: true,
                    generation,
                    handle: None,
                },
            );
            drop(endpoints);
            log::info!("Reusing running {} on port {}", spec.kind, port);
            return Ok(StartReport {
                kind: spec.kind,
                port,
                reused: true,
                relocated_from: None,
                state: StartState::Ready,
            });
        }

        let pid = self.spawn_tracked(spec, port, generation)?;
        log::info!("Started {} (pid: {}, port: {})", spec.kind, pid, port);

        let state = self
            .wait_for_startup(spec.kind, generation, port, &spec.health_path)
            .await;
        match state {
            StartState::Ready => log::info!("{} is ready on port {}", spec.kind, port),
            StartState::Unconfirmed => log::warn!(
                "{} did not answer its health probe within {}s, leaving it running",
                spec.kind,
                self.timings.startup_timeout.as_secs()
            ),
            StartState::Exited => log::error!("{} exited during startup", spec.kind),
        }

        Ok(StartReport {
            kind: spec.kind,
            port,
            reused: false,
            relocated_from: resolution.relocated_from,
            state,
        })
    }

    fn spawn_tracked(&self, spec: &ServiceSpec, port: u16, generation: u64) -> Result<u32> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .env("PORT", port.to_string())
            .env("WORKSPACE_DIR", &spec.working_dir)
            .env(PROCESS_NAME_ENV, spec.kind.process_tag());
        prepare_command(&mut cmd);

        let label = spec.kind.as_str();
        let on_exit: ExitCallback = {
            let endpoints = Arc::clone(&self.endpoints);
            let kind = spec.kind;
            Box::new(move |info: ExitInfo| forget_exited(&endpoints, kind, generation, info))
        };

        // Held across the spawn so the exit callback cannot run before the endpoint exists.
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        let handle = ProcessHandle::spawn(
            cmd,
            label,
            Arc::new(move |stream: StreamKind, chunk: &str| {
                for line in chunk.lines().filter(|line| !line.trim().is_empty()) {
                    match stream {
                        StreamKind::Stdout => log::info!("[{} stdout] {}", label, line),
                        StreamKind::Stderr => log::warn!("[{} stderr] {}", label, line),
                    }
                }
            }),
            on_exit,
        )
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::binary_not_found(&spec.program)
            } else {
                AppError::process(format!("Failed to start {}: {}", label, e))
            }
        })?;

        let pid = handle.pid();
        endpoints.insert(
            spec.kind,
            ServiceEndpoint {
                kind: spec.kind,
                desired_port: spec.desired_port,
                port,
                reused: false,
                generation,
                handle: Some(handle),
            },
        );
        drop(endpoints);
        Ok(pid)
    }

    /// Poll the health endpoint until it answers, the process exits, or the
    /// startup timeout elapses.
    async fn wait_for_startup(
        &self,
        kind: ServiceKind,
        generation: u64,
        port: u16,
        health_path: &str,
    ) -> StartState {
        let deadline = Instant::now() + self.timings.startup_timeout;

        loop {
            if !self.is_generation_tracked(kind, generation) {
                return StartState::Exited;
            }
            if check_health(&self.http_client, port, health_path).await {
                return StartState::Ready;
            }
            if Instant::now() >= deadline {
                return StartState::Unconfirmed;
            }
            tokio::time::sleep(self.timings.poll_interval).await;
        }
    }

    /// Stop a tracked service. Always returns within the kill ceiling.
    ///
    /// Reused instances are only forgotten; they are not ours to kill.
    pub async fn stop(&self, kind: ServiceKind) -> bool {
        let removed = {
            let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
            endpoints.remove(&kind)
        };
        let Some(mut endpoint) = removed else {
            return false;
        };

        match endpoint.handle.as_mut() {
            Some(handle) => {
                log::info!(
                    "Stopping {} (pid: {}, port: {})",
                    kind,
                    handle.pid(),
                    endpoint.port
                );
                terminate(handle, self.timings.kill_ceiling).await;
            }
            None => log::info!("Releasing reused {} on port {}", kind, endpoint.port),
        }
        true
    }

    /// Stop all tracked services concurrently.
    pub async fn stop_all(&self) {
        let kinds = self.get_tracked_kinds();
        join_all(kinds.into_iter().map(|kind| self.stop(kind))).await;
    }

    /// Track `handle` as `kind` on `port` without spawning anything.
    #[cfg(test)]
    pub(crate) fn adopt(&self, kind: ServiceKind, port: u16, handle: ProcessHandle) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let mut endpoints = self.endpoints.write().unwrap_or_else(|e| e.into_inner());
        endpoints.insert(
            kind,
            ServiceEndpoint {
                kind,
                desired_port: port,
                port,
                reused: false,
                generation,
                handle: Some(handle),
            },
        );
    }
}

fn forget_exited(endpoints: &EndpointMap, kind: ServiceKind, generation: u64, info: ExitInfo) {
    let removed = {
        let mut endpoints = endpoints.write().unwrap_or_else(|e| e.into_inner());
        match endpoints.get(&kind) {
            Some(endpoint) if endpoint.generation == generation => endpoints.remove(&kind),
            _ => None,
        }
    };

    match removed {
        // Exit after an explicit stop or a replacement.
        None => log::debug!("{} process exited with {}", kind, info),
        Some(_) if info.success() => log::info!("{} process exited", kind),
        Some(endpoint) => log::error!(
            "{} process on port {} exited unexpectedly with {}",
            kind,
            endpoint.port,
            info
        ),
    }
}
