//! On-demand automation agent runs.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use uuid::Uuid;

use super::control::{prepare_command, terminate};
use super::handle::{ChunkCallback, ExitCallback, ExitInfo, ProcessHandle, StreamKind};
use super::{AgentTimings, PROCESS_NAME_ENV};
use crate::config::{AgentConfig, OutputFormat};
use crate::error::{AppError, Result};
use crate::host::{HostNotifier, OutputSink};
use crate::paths::{agent_install_dirs, build_search_path, AGENT_COMMAND};

/// Tag passed to agent processes through [`PROCESS_NAME_ENV`].
pub const AGENT_PROCESS_TAG: &str = "extension-supervisor-agent";

/// One request to run the automation CLI.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub prompt: String,
    pub workdir: PathBuf,
    /// Pre-resolved executable; `None` falls back to the bare command name.
    pub executable: Option<PathBuf>,
    pub output_format: OutputFormat,
    pub force_allow: bool,
    pub timeout: Option<Duration>,
    pub env: HashMap<String, String>,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            prompt: prompt.into(),
            workdir: workdir.into(),
            executable: None,
            output_format: OutputFormat::Text,
            force_allow: false,
            timeout: None,
            env: HashMap::new(),
        }
    }

    pub fn from_config(prompt: impl Into<String>, workdir: &Path, config: &AgentConfig) -> Self {
        let timeout = (config.timeout_minutes > 0)
            .then(|| Duration::from_secs(config.timeout_minutes.saturating_mul(60)));
        Self {
            prompt: prompt.into(),
            workdir: workdir.to_path_buf(),
            executable: config.executable.clone(),
            output_format: config.output_format,
            force_allow: config.force_allow,
            timeout,
            env: config.env.clone(),
        }
    }

    fn program(&self) -> PathBuf {
        self.executable
            .clone()
            .unwrap_or_else(|| PathBuf::from(AGENT_COMMAND))
    }

    /// Print mode with the prompt, then output format and permission bypass.
    fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.prompt.clone(),
            "--output-format".to_string(),
            self.output_format.as_arg().to_string(),
        ];
        if self.output_format == OutputFormat::StreamJson {
            args.push("--verbose".to_string());
        }
        if self.force_allow {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AgentRunState {
    Running,
    Completed { exit_code: Option<i32> },
    TimedOut,
    Failed { reason: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentRun {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub state: AgentRunState,
}

/// Read-only projection handed to the host.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub running: bool,
    pub current: Option<AgentRun>,
    pub last: Option<AgentRun>,
}

struct ActiveRun {
    run: AgentRun,
    handle: Option<ProcessHandle>,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct RunnerState {
    last_start: Option<Instant>,
    active: Option<ActiveRun>,
    last: Option<AgentRun>,
}

struct RunnerInner {
    state: Mutex<RunnerState>,
    /// `true` while a run is active, including one that is still being stopped.
    busy: watch::Sender<bool>,
    sink: Arc<dyn OutputSink>,
    notifier: Arc<dyn HostNotifier>,
    timings: AgentTimings,
}

/// Runs the automation CLI in the background, one run at a time.
#[derive(Clone)]
pub struct AgentProcessRunner {
    inner: Arc<RunnerInner>,
}

impl AgentProcessRunner {
    pub fn new(
        sink: Arc<dyn OutputSink>,
        notifier: Arc<dyn HostNotifier>,
        timings: AgentTimings,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                state: Mutex::new(RunnerState::default()),
                busy: watch::channel(false).0,
                sink,
                notifier,
                timings,
            }),
        }
    }

    /// Start a run whose output is streamed to the sink.
    ///
    /// Rejected while a run is active or within the start cooldown. A spawn
    /// failure is reported to the host as a warning. Must be called from
    /// within a tokio runtime.
    pub fn run_in_background(&self, request: AgentRequest) -> Result<Uuid> {
        let inner = &self.inner;
        let now = Instant::now();
        let mut state = inner.lock_state();

        if let Some(active) = &state.active {
            let id = active.run.id;
            drop(state);
            log::info!("Agent start ignored: run {} is still active", id);
            return Err(AppError::agent_busy(&id.to_string()));
        }

        if let Some(last_start) = state.last_start {
            let elapsed = now.duration_since(last_start);
            if elapsed < inner.timings.cooldown {
                drop(state);
                let remaining = inner.timings.cooldown - elapsed;
                log::info!(
                    "Agent start ignored: previous run started {}ms ago",
                    elapsed.as_millis()
                );
                return Err(AppError::agent_cooldown(remaining.as_secs().max(1)));
            }
        }

        let previous_start = state.last_start.replace(now);
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let deadline = request
            .timeout
            .and_then(|timeout| chrono::Duration::from_std(timeout).ok())
            .map(|timeout| started_at + timeout);

        let spawned = build_command(&request).and_then(|cmd| {
            let on_chunk: ChunkCallback = {
                let sink = Arc::clone(&inner.sink);
                Arc::new(move |_: StreamKind, chunk: &str| sink.append(chunk))
            };
            let on_exit: ExitCallback = {
                let inner = Arc::clone(inner);
                Box::new(move |info: ExitInfo| inner.finish(id, info))
            };
            ProcessHandle::spawn(cmd, "agent", on_chunk, on_exit).map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    AppError::binary_not_found(&request.program().to_string_lossy())
                } else {
                    AppError::process(format!("Failed to start agent: {}", e))
                }
            })
        });

        match spawned {
            Ok(handle) => {
                let pid = handle.pid();
                let timer = request
                    .timeout
                    .filter(|timeout| !timeout.is_zero())
                    .map(|timeout| {
                        let inner = Arc::clone(inner);
                        tokio::spawn(async move {
                            tokio::time::sleep(timeout).await;
                            inner.time_out(id, timeout).await;
                        })
                        .abort_handle()
                    });
                state.active = Some(ActiveRun {
                    run: AgentRun {
                        id,
                        started_at,
                        deadline,
                        state: AgentRunState::Running,
                    },
                    handle: Some(handle),
                    timer,
                });
                inner.busy.send_replace(true);
                drop(state);
                log::info!("Agent run {} started (pid: {})", id, pid);
                Ok(id)
            }
            Err(err) => {
                // Nothing was launched, so the failed attempt does not count.
                state.last_start = previous_start;
                state.last = Some(AgentRun {
                    id,
                    started_at,
                    deadline: None,
                    state: AgentRunState::Failed {
                        reason: err.to_string(),
                    },
                });
                drop(state);
                log::error!("Agent run {} failed to start: {}", id, err);
                inner
                    .notifier
                    .warn(&format!("Automation could not be started: {}", err));
                Err(err)
            }
        }
    }

    /// Terminate the in-flight run, if any. Returns `true` if a run was cancelled.
    ///
    /// A run already being stopped by its timeout is waited for, up to the
    /// kill ceiling, but not reported as cancelled.
    pub async fn cancel(&self) -> bool {
        let (taken, stopping) = {
            let mut state = self.inner.lock_state();
            match state.active.as_mut() {
                Some(active) if active.run.state == AgentRunState::Running => {
                    active.run.state = AgentRunState::Cancelled;
                    if let Some(timer) = active.timer.take() {
                        timer.abort();
                    }
                    (Some((active.run.id, active.handle.take())), None)
                }
                Some(active) => (None, Some(active.run.id)),
                None => (None, None),
            }
        };
        if let Some(id) = stopping {
            log::debug!("Waiting for agent run {} to finish stopping", id);
            if !self.wait_idle(self.inner.timings.kill_ceiling).await {
                log::warn!("Agent run {} is still stopping, giving up", id);
            }
            return false;
        }
        let Some((id, handle)) = taken else {
            return false;
        };

        log::info!("Cancelling agent run {}", id);
        if let Some(mut handle) = handle {
            terminate(&mut handle, self.inner.timings.kill_ceiling).await;
        }
        self.inner.settle(id);
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().active.is_some()
    }

    /// Wait until no run is active. Returns `false` if `ceiling` elapsed first.
    pub async fn wait_idle(&self, ceiling: Duration) -> bool {
        let mut busy = self.inner.busy.subscribe();
        let idle = tokio::time::timeout(ceiling, busy.wait_for(|active| !*active))
            .await
            .is_ok_and(|changed| changed.is_ok());
        idle
    }

    /// Install `handle` as the active run without spawning anything.
    #[cfg(test)]
    pub(crate) fn adopt(&self, run_state: AgentRunState, handle: Option<ProcessHandle>) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.inner.lock_state();
        state.active = Some(ActiveRun {
            run: AgentRun {
                id,
                started_at: Utc::now(),
                deadline: None,
                state: run_state,
            },
            handle,
            timer: None,
        });
        self.inner.busy.send_replace(true);
        id
    }

    pub fn status(&self) -> AgentStatus {
        let state = self.inner.lock_state();
        AgentStatus {
            running: state.active.is_some(),
            current: state.active.as_ref().map(|active| active.run.clone()),
            last: state.last.clone(),
        }
    }
}

impl RunnerInner {
    fn lock_state(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Exit callback of the agent process.
    fn finish(&self, id: Uuid, info: ExitInfo) {
        let mut state = self.lock_state();
        let Some(mut active) = state.active.take_if(|active| active.run.id == id) else {
            return;
        };
        if let Some(timer) = active.timer.take() {
            timer.abort();
        }
        if active.run.state == AgentRunState::Running {
            active.run.state = AgentRunState::Completed {
                exit_code: info.code,
            };
        }
        let run = active.run.clone();
        state.last = Some(active.run);
        self.busy.send_replace(false);
        drop(state);

        match run.state {
            AgentRunState::Completed { .. } if info.success() => {
                log::info!("Agent run {} completed", id)
            }
            AgentRunState::Completed { .. } => {
                log::warn!("Agent run {} exited with {}", id, info)
            }
            _ => log::info!("Agent run {} ended with {}", id, info),
        }
    }

    /// Timer callback: kill a run that outlived its timeout.
    async fn time_out(&self, id: Uuid, after: Duration) {
        let handle = {
            let mut state = self.lock_state();
            match state.active.as_mut() {
                Some(active)
                    if active.run.id == id && active.run.state == AgentRunState::Running =>
                {
                    active.run.state = AgentRunState::TimedOut;
                    active.timer = None;
                    active.handle.take()
                }
                _ => None,
            }
        };
        let Some(mut handle) = handle else {
            return;
        };

        let minutes = after.as_secs_f64() / 60.0;
        log::warn!(
            "Agent run {} timed out after {:.1} minutes, terminating (pid: {})",
            id,
            minutes,
            handle.pid()
        );
        self.sink.append(&format!(
            "\n[agent run timed out after {:.1} minutes and was terminated]\n",
            minutes
        ));
        terminate(&mut handle, self.timings.kill_ceiling).await;
        self.settle(id);
    }

    /// Move a run that was stopped by us into history if its exit was never observed.
    fn settle(&self, id: Uuid) {
        let mut state = self.lock_state();
        if let Some(active) = state.active.take_if(|active| active.run.id == id) {
            state.last = Some(active.run);
            self.busy.send_replace(false);
        }
    }
}

fn build_command(request: &AgentRequest) -> Result<Command> {
    let search_path = build_search_path(&agent_install_dirs())?;
    let program = resolve_program(&request.program(), &search_path, &request.workdir)?;

    // Batch shims are spawned directly so the standard library escapes their arguments.
    let mut cmd = Command::new(program);
    cmd.args(request.args())
        .current_dir(&request.workdir)
        .env("PATH", &search_path)
        .envs(&request.env)
        .env(PROCESS_NAME_ENV, AGENT_PROCESS_TAG);
    prepare_command(&mut cmd);
    Ok(cmd)
}

/// Locate `program` on `search_path` (honouring `PATHEXT` on Windows), or
/// relative to `cwd` when it contains a path separator.
fn resolve_program(program: &Path, search_path: &OsStr, cwd: &Path) -> Result<PathBuf> {
    which::which_in(program, Some(search_path), cwd).map_err(|e| {
        log::debug!("Could not resolve {}: {}", program.display(), e);
        AppError::binary_not_found(&program.to_string_lossy())
    })
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt as _;

    use super::*;
    use crate::error::ErrorKind;
    use crate::host::BufferSink;
    use crate::process::is_process_alive;

    #[derive(Default)]
    struct RecordingNotifier {
        warnings: Mutex<Vec<String>>,
    }

    impl HostNotifier for RecordingNotifier {
        fn info(&self, _message: &str) {}

        fn warn(&self, message: &str) {
            self.warnings.lock().unwrap().push(message.to_string());
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        sink: Arc<BufferSink>,
        notifier: Arc<RecordingNotifier>,
        runner: AgentProcessRunner,
    }

    fn fixture(cooldown: Duration) -> Fixture {
        let sink = Arc::new(BufferSink::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let runner = AgentProcessRunner::new(
            Arc::clone(&sink) as Arc<dyn OutputSink>,
            Arc::clone(&notifier) as Arc<dyn HostNotifier>,
            AgentTimings {
                cooldown,
                kill_ceiling: Duration::from_secs(2),
            },
        );
        Fixture {
            dir: tempfile::tempdir().unwrap(),
            sink,
            notifier,
            runner,
        }
    }

    impl Fixture {
        fn request(&self, body: &str) -> AgentRequest {
            let path = self.dir.path().join("agent.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            let mut request = AgentRequest::new("summarize the repo", self.dir.path());
            request.executable = Some(path);
            request
        }

        async fn wait_idle(&self) {
            let deadline = Instant::now() + Duration::from_secs(10);
            while self.runner.is_running() {
                assert!(Instant::now() < deadline, "agent run did not finish");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    #[test]
    fn args_encode_prompt_format_and_permissions() {
        let mut request = AgentRequest::new("do it", "/tmp");
        assert_eq!(
            request.args(),
            vec!["-p", "do it", "--output-format", "text"]
        );

        request.output_format = OutputFormat::StreamJson;
        request.force_allow = true;
        assert_eq!(
            request.args(),
            vec![
                "-p",
                "do it",
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
            ]
        );
    }

    #[test]
    fn config_timeout_is_minutes() {
        let config = AgentConfig {
            timeout_minutes: 45,
            ..AgentConfig::default()
        };
        let request = AgentRequest::from_config("p", Path::new("/tmp"), &config);
        assert_eq!(request.timeout, Some(Duration::from_secs(45 * 60)));

        let config = AgentConfig {
            timeout_minutes: 0,
            ..AgentConfig::default()
        };
        let request = AgentRequest::from_config("p", Path::new("/tmp"), &config);
        assert_eq!(request.timeout, None);
    }

    #[tokio::test]
    async fn streams_output_and_completes() {
        let fx = fixture(Duration::ZERO);
        let mut request = fx.request("printf 'first\\n'\nprintf '%s\\n' \"$@\"\necho \"api=$API_BASE\" >&2");
        request
            .env
            .insert("API_BASE".to_string(), "http://127.0.0.1:9".to_string());

        let id = fx.runner.run_in_background(request).unwrap();
        fx.wait_idle().await;

        let output = fx.sink.contents();
        assert!(output.contains("first\n"));
        assert!(output.contains("-p\nsummarize the repo\n--output-format\ntext\n"));
        assert!(output.contains("api=http://127.0.0.1:9"));

        let last = fx.runner.status().last.unwrap();
        assert_eq!(last.id, id);
        assert_eq!(last.state, AgentRunState::Completed { exit_code: Some(0) });
    }

    #[tokio::test]
    async fn second_start_within_cooldown_is_rejected() {
        let fx = fixture(Duration::from_secs(60));
        let counter = fx.dir.path().join("count");
        let body = format!("echo run >> '{}'", counter.display());

        fx.runner.run_in_background(fx.request(&body)).unwrap();
        fx.wait_idle().await;

        let err = fx.runner.run_in_background(fx.request(&body)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AgentCooldown);

        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 1);
    }

    #[tokio::test]
    async fn start_while_running_is_rejected() {
        let fx = fixture(Duration::ZERO);

        fx.runner.run_in_background(fx.request("exec sleep 30")).unwrap();
        let err = fx
            .runner
            .run_in_background(fx.request("exec sleep 30"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AgentBusy);

        assert!(fx.runner.cancel().await);
        assert!(!fx.runner.is_running());
        assert_eq!(
            fx.runner.status().last.unwrap().state,
            AgentRunState::Cancelled
        );
    }

    #[tokio::test]
    async fn timeout_kills_run_once() {
        let fx = fixture(Duration::ZERO);
        let pid_file = fx.dir.path().join("pid");
        let mut request = fx.request(&format!("echo $$ > '{}'\nexec sleep 30", pid_file.display()));
        request.timeout = Some(Duration::from_millis(300));

        let id = fx.runner.run_in_background(request).unwrap();
        assert!(fx.runner.status().current.unwrap().deadline.is_some());
        fx.wait_idle().await;

        let last = fx.runner.status().last.unwrap();
        assert_eq!(last.id, id);
        assert_eq!(last.state, AgentRunState::TimedOut);
        assert_eq!(fx.sink.contents().matches("timed out").count(), 1);

        let pid: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn normal_exit_disarms_timer() {
        let fx = fixture(Duration::ZERO);
        let mut request = fx.request("exit 0");
        request.timeout = Some(Duration::from_millis(200));

        fx.runner.run_in_background(request).unwrap();
        fx.wait_idle().await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(
            fx.runner.status().last.unwrap().state,
            AgentRunState::Completed { exit_code: Some(0) }
        );
        assert!(!fx.sink.contents().contains("timed out"));
    }

    #[tokio::test]
    async fn missing_binary_warns_host() {
        let fx = fixture(Duration::from_secs(60));
        let mut request = AgentRequest::new("p", fx.dir.path());
        request.executable = Some(fx.dir.path().join("no-such-agent"));

        let err = fx.runner.run_in_background(request.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BinaryNotFound);
        assert!(matches!(
            fx.runner.status().last.unwrap().state,
            AgentRunState::Failed { .. }
        ));
        assert_eq!(fx.notifier.warnings.lock().unwrap().len(), 1);

        // A failed launch does not start the cooldown.
        let err = fx.runner.run_in_background(request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BinaryNotFound);
    }

    #[test]
    fn bare_name_resolves_on_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let agent = dir.path().join("fake-agent");
        std::fs::write(&agent, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o755)).unwrap();
        let search_path = dir.path().as_os_str();

        let resolved =
            resolve_program(Path::new("fake-agent"), search_path, Path::new("/")).unwrap();
        assert_eq!(resolved, agent);

        let err = resolve_program(Path::new("other-agent"), search_path, Path::new("/"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BinaryNotFound);
    }

    #[test]
    fn non_executable_file_is_not_an_agent() {
        let dir = tempfile::tempdir().unwrap();
        let agent = dir.path().join("fake-agent");
        std::fs::write(&agent, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&agent, std::fs::Permissions::from_mode(0o644)).unwrap();

        let err = resolve_program(&agent, dir.path().as_os_str(), dir.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BinaryNotFound);
    }

    #[tokio::test]
    async fn cancel_waits_for_run_stopped_by_timeout() {
        let fx = fixture(Duration::ZERO);
        let id = fx.runner.adopt(AgentRunState::TimedOut, None);

        let inner = Arc::clone(&fx.runner.inner);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            inner.settle(id);
        });

        let started = Instant::now();
        assert!(!fx.runner.cancel().await);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!fx.runner.is_running());
        assert_eq!(
            fx.runner.status().last.unwrap().state,
            AgentRunState::TimedOut
        );
    }

    #[tokio::test]
    async fn cancel_without_run_is_a_no_op() {
        let fx = fixture(Duration::ZERO);
        assert!(!fx.runner.cancel().await);
    }
}
