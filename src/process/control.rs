//! Platform-agnostic process control functions.

use std::time::Duration;

use super::handle::{ExitInfo, ProcessHandle};
use crate::error::{AppError, Result};

/// Check if a process is alive by PID.
#[cfg(target_os = "windows")]
pub fn is_process_alive(pid: u32) -> bool {
    use windows::Win32::Foundation::{CloseHandle, STILL_ACTIVE};
    use windows::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };

    unsafe {
        match OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, false, pid) {
            Ok(handle) => {
                let mut exit_code: u32 = 0;
                let alive = GetExitCodeProcess(handle, &mut exit_code).is_ok()
                    && (exit_code as i32) == STILL_ACTIVE.0;
                let _ = CloseHandle(handle);
                alive
            }
            Err(_) => false,
        }
    }
}

/// Check if a process is alive by PID.
#[cfg(not(target_os = "windows"))]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;

    match checked_pid(pid) {
        Ok(target) => kill(target, None).is_ok(),
        Err(_) => false,
    }
}

/// Refuse pids that would address a group of processes or ourselves.
#[cfg(not(target_os = "windows"))]
fn checked_pid(pid: u32) -> Result<nix::unistd::Pid> {
    let raw = i32::try_from(pid)
        .map_err(|_| AppError::process(format!("PID {} out of range", pid)))?;
    if raw <= 1 || pid == std::process::id() {
        return Err(AppError::process(format!("Refusing to signal PID {}", pid)));
    }
    Ok(nix::unistd::Pid::from_raw(raw))
}

#[cfg(target_os = "windows")]
fn taskkill(pid: u32) -> Result<()> {
    use std::os::windows::process::CommandExt as _;
    use windows::Win32::System::Threading::CREATE_NO_WINDOW;

    if pid == 0 || pid == std::process::id() {
        return Err(AppError::process(format!("Refusing to kill PID {}", pid)));
    }

    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .creation_flags(CREATE_NO_WINDOW.0)
        .output()
        .map_err(|e| AppError::process(format!("Failed to run taskkill: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = stderr.trim();
        let detail = if detail.is_empty() {
            stdout.trim()
        } else {
            detail
        };
        Err(AppError::process(format!(
            "taskkill failed for pid {}: {}",
            pid,
            if detail.is_empty() {
                "(no output)"
            } else {
                detail
            }
        )))
    }
}

/// Kill a process and all of its descendants.
#[cfg(target_os = "windows")]
pub fn kill_tree(pid: u32) -> Result<()> {
    taskkill(pid)
}

/// Kill a process and all of its descendants.
///
/// Children spawned by the supervisor lead their own process group, so the
/// whole group is signalled. A group that is already gone is not an error.
#[cfg(not(target_os = "windows"))]
pub fn kill_tree(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::getpgrp;

    let group = checked_pid(pid)?;
    if group == getpgrp() {
        return Err(AppError::process(format!(
            "Refusing to kill our own process group {}",
            pid
        )));
    }
    match killpg(group, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(AppError::process(format!(
            "Failed to kill process group {}: {}",
            pid, e
        ))),
    }
}

/// Forcefully kill a single process that the supervisor did not spawn itself.
#[cfg(target_os = "windows")]
pub fn force_kill(pid: u32) -> Result<()> {
    taskkill(pid)
}

/// Forcefully kill a single process that the supervisor did not spawn itself.
#[cfg(not(target_os = "windows"))]
pub fn force_kill(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};

    match kill(checked_pid(pid)?, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(AppError::process(format!(
            "Failed to kill process {}: {}",
            pid, e
        ))),
    }
}

/// Put a child into its own process group (unix) or suppress its console
/// window (Windows) so it can later be torn down as a tree.
pub(crate) fn prepare_command(cmd: &mut tokio::process::Command) {
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    #[cfg(target_os = "windows")]
    {
        use windows::Win32::System::Threading::CREATE_NO_WINDOW;
        cmd.creation_flags(CREATE_NO_WINDOW.0);
    }
}

/// Stop a tracked child.
///
/// The pipes are closed before any signal is sent, then the child is killed,
/// then its whole tree. Waits for the exit event no longer than `ceiling` and
/// returns the exit status if it was observed.
pub async fn terminate(handle: &mut ProcessHandle, ceiling: Duration) -> Option<ExitInfo> {
    handle.detach_streams().await;
    if let Some(info) = handle.exit_info() {
        return Some(info);
    }

    let pid = handle.pid();
    let label = handle.label().to_string();
    handle.request_kill();

    match tokio::task::spawn_blocking(move || kill_tree(pid)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Tree kill of {} (pid {}) failed: {}", label, pid, e),
        Err(e) => log::warn!("Tree kill task for {} (pid {}) failed: {}", label, pid, e),
    }

    let exit = handle.wait_exit(ceiling).await;
    match exit {
        Some(info) => log::info!("{} (pid {}) stopped with {}", label, pid, info),
        None => log::warn!(
            "{} (pid {}) did not report exit within {}ms, giving up",
            label,
            pid,
            ceiling.as_millis()
        ),
    }
    exit
}
