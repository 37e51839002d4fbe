//! Centralized path utilities for the supervisor.

use std::ffi::OsString;
use std::path::PathBuf;

use crate::error::{AppError, Result};

/// Bare command name of the automation CLI, resolved through `PATH`.
pub const AGENT_COMMAND: &str = "claude";

/// Get the default config file path (`<config dir>/extension-supervisor/config.toml`).
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("extension-supervisor")
        .join("config.toml")
}

/// Well-known directories the automation CLI is commonly installed into.
///
/// Only directories that exist on this machine are returned.
pub fn agent_install_dirs() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".claude").join("local"));
        candidates.push(home.join(".local").join("bin"));
        candidates.push(home.join(".npm-global").join("bin"));
        candidates.push(home.join(".bun").join("bin"));
        #[cfg(target_os = "windows")]
        candidates.push(home.join("AppData").join("Roaming").join("npm"));
    }

    #[cfg(not(target_os = "windows"))]
    {
        candidates.push(PathBuf::from("/usr/local/bin"));
        candidates.push(PathBuf::from("/opt/homebrew/bin"));
    }

    candidates.into_iter().filter(|dir| dir.is_dir()).collect()
}

/// Build a `PATH` value with `extra` directories prepended to the inherited one.
///
/// Directories already present in the inherited `PATH` are not repeated.
pub fn build_search_path(extra: &[PathBuf]) -> Result<OsString> {
    let inherited: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|path| std::env::split_paths(&path).collect())
        .unwrap_or_default();

    let mut entries: Vec<PathBuf> = extra
        .iter()
        .filter(|dir| !inherited.contains(dir))
        .cloned()
        .collect();
    entries.extend(inherited);

    std::env::join_paths(entries)
        .map_err(|e| AppError::config(format!("Failed to build PATH: {}", e)))
}
