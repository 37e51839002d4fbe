//! Surfaces the host application exposes to the supervisor.

use std::io::Write as _;
use std::sync::Mutex;

use crate::error::Result;

/// Append-only text surface. The supervisor only ever writes to it.
pub trait OutputSink: Send + Sync {
    fn append(&self, text: &str);
}

/// User-visible notices.
pub trait HostNotifier: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
}

/// UI pieces the shutdown sequence has to tear down.
pub trait HostUi: Send + Sync {
    /// Close interactive panels that may hold locks on the extension's files.
    fn close_panels(&self) -> Result<()>;
    /// Hide status bar items and similar affordances.
    fn release_status_items(&self) -> Result<()>;
}

/// Writes agent output straight to the process stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn append(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

/// Routes agent output into the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl OutputSink for LogSink {
    fn append(&self, text: &str) {
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            log::info!("[agent] {}", line);
        }
    }
}

/// Keeps everything written to it; useful for hosts that render output later.
#[derive(Debug, Default)]
pub struct BufferSink {
    chunks: Mutex<Vec<String>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.chunks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .concat()
    }
}

impl OutputSink for BufferSink {
    fn append(&self, text: &str) {
        self.chunks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
    }
}

#[derive(Debug, Default)]
pub struct LogNotifier;

impl HostNotifier for LogNotifier {
    fn info(&self, message: &str) {
        log::info!("{}", message);
    }

    fn warn(&self, message: &str) {
        log::warn!("{}", message);
    }
}

/// Host without any UI.
#[derive(Debug, Default)]
pub struct HeadlessUi;

impl HostUi for HeadlessUi {
    fn close_panels(&self) -> Result<()> {
        Ok(())
    }

    fn release_status_items(&self) -> Result<()> {
        Ok(())
    }
}
