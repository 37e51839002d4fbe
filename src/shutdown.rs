//! Ordered, idempotent teardown of everything the supervisor started.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::host::HostUi;
use crate::process::{sweep_orphans, AgentProcessRunner, ServiceProcessManager};
use crate::timers::TimerRegistry;

/// Borrowed view of what has to be torn down.
pub(crate) struct ShutdownTargets<'a> {
    pub ui: &'a dyn HostUi,
    pub timers: &'a TimerRegistry,
    pub services: &'a ServiceProcessManager,
    pub agent: &'a AgentProcessRunner,
    pub extension_dir: Option<PathBuf>,
    pub markers: Vec<String>,
}

pub(crate) struct ShutdownCoordinator {
    deactivated: AtomicBool,
    sweep_ceiling: Duration,
}

impl ShutdownCoordinator {
    pub(crate) fn new(sweep_ceiling: Duration) -> Self {
        Self {
            deactivated: AtomicBool::new(false),
            sweep_ceiling,
        }
    }

    pub(crate) fn is_deactivated(&self) -> bool {
        self.deactivated.load(Ordering::SeqCst)
    }

    /// Run the teardown sequence. Returns `false` if it already ran.
    ///
    /// No step's failure stops the steps after it.
    pub(crate) async fn deactivate(&self, targets: ShutdownTargets<'_>) -> bool {
        if self.deactivated.swap(true, Ordering::SeqCst) {
            log::debug!("Deactivate called again, ignoring");
            return false;
        }
        log::info!("Deactivating supervisor");

        if let Err(e) = targets.ui.close_panels() {
            log::warn!("Failed to close panels: {}", e);
        }

        let cancelled = targets.timers.cancel_all();
        if cancelled > 0 {
            log::debug!("Cancelled {} timer(s)", cancelled);
        }

        if let Err(e) = targets.ui.release_status_items() {
            log::warn!("Failed to release status items: {}", e);
        }

        let (_, agent_cancelled) =
            futures_util::future::join(targets.services.stop_all(), targets.agent.cancel()).await;
        if agent_cancelled {
            log::info!("Cancelled running agent during shutdown");
        }

        if let Some(dir) = targets.extension_dir {
            self.sweep(dir, targets.markers).await;
        }

        log::info!("Supervisor deactivated");
        true
    }

    async fn sweep(&self, dir: PathBuf, markers: Vec<String>) {
        let task = tokio::task::spawn_blocking(move || sweep_orphans(&dir, &markers));
        match tokio::time::timeout(self.sweep_ceiling, task).await {
            Ok(Ok(Ok(0))) => {}
            Ok(Ok(Ok(count))) => log::info!("Orphan sweep targeted {} process(es)", count),
            Ok(Ok(Err(e))) => log::debug!("Orphan sweep failed: {}", e),
            Ok(Err(e)) => log::debug!("Orphan sweep task failed: {}", e),
            Err(_) => log::debug!(
                "Orphan sweep did not finish within {}s",
                self.sweep_ceiling.as_secs()
            ),
        }
    }
}
