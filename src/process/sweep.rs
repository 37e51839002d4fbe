//! Last-resort cleanup of worker processes orphaned by a killed shell layer.

use std::path::Path;

use super::control::force_kill;
use crate::error::{AppError, Result};

/// Kill every process whose command line references `install_dir` and one of
/// `markers`. Returns how many processes were targeted.
///
/// Blocking; run it off the async executor.
pub fn sweep_orphans(install_dir: &Path, markers: &[String]) -> Result<usize> {
    let markers: Vec<&str> = markers
        .iter()
        .map(|m| m.trim())
        .filter(|m| !m.is_empty())
        .collect();
    if markers.is_empty() {
        return Ok(0);
    }

    let needle = install_dir.to_string_lossy();
    if needle.trim().is_empty() {
        return Ok(0);
    }

    let listing = list_processes()?;
    let pids = select_orphans(&listing, &needle, &markers, std::process::id());

    for &pid in &pids {
        match force_kill(pid) {
            Ok(()) => log::info!("Killed orphaned process {}", pid),
            Err(e) => log::debug!("Failed to kill orphaned process {}: {}", pid, e),
        }
    }
    Ok(pids.len())
}

/// Pick pids out of a `<pid> <command line>` listing.
pub(crate) fn select_orphans(
    listing: &str,
    install_dir: &str,
    markers: &[&str],
    self_pid: u32,
) -> Vec<u32> {
    let install_dir = normalize(install_dir);

    listing
        .lines()
        .filter_map(|line| {
            let (pid, cmdline) = line.trim().split_once(char::is_whitespace)?;
            let pid: u32 = pid.parse().ok()?;
            Some((pid, normalize(cmdline)))
        })
        .filter(|(pid, _)| *pid != self_pid)
        .filter(|(_, cmdline)| cmdline.contains(&install_dir))
        .filter(|(_, cmdline)| markers.iter().any(|m| cmdline.contains(&normalize(m))))
        .map(|(pid, _)| pid)
        .collect()
}

/// Windows paths compare case-insensitively.
#[cfg(target_os = "windows")]
fn normalize(text: &str) -> String {
    text.to_lowercase()
}

#[cfg(not(target_os = "windows"))]
fn normalize(text: &str) -> String {
    text.to_string()
}

#[cfg(unix)]
fn list_processes() -> Result<String> {
    let output = std::process::Command::new("ps")
        .args(["-axo", "pid=,args="])
        .output()
        .map_err(|e| AppError::process(format!("Failed to run ps: {}", e)))?;
    if !output.status.success() {
        return Err(AppError::process(format!("ps exited with {}", output.status)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(target_os = "windows")]
fn list_processes() -> Result<String> {
    use std::os::windows::process::CommandExt as _;
    use windows::Win32::System::Threading::CREATE_NO_WINDOW;

    let output = std::process::Command::new("powershell")
        .args([
            "-NoProfile",
            "-NonInteractive",
            "-Command",
            "Get-CimInstance Win32_Process | ForEach-Object { \"$($_.ProcessId) $($_.CommandLine)\" }",
        ])
        .creation_flags(CREATE_NO_WINDOW.0)
        .output()
        .map_err(|e| AppError::process(format!("Failed to run powershell: {}", e)))?;
    if !output.status.success() {
        return Err(AppError::process(format!(
            "powershell exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(not(any(unix, target_os = "windows")))]
fn list_processes() -> Result<String> {
    Err(AppError::process("Orphan sweep is not supported on this platform"))
}
