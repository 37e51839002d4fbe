//! Registry of periodic tasks owned by the supervisor.

use std::sync::Mutex;

use tokio::task::JoinHandle;

/// Owns every periodic task started by the supervisor.
#[derive(Debug, Default)]
pub(crate) struct TimerRegistry {
    inner: Mutex<TimerState>,
}

#[derive(Debug, Default)]
struct TimerState {
    tasks: Vec<JoinHandle<()>>,
    cancelled: bool,
}

impl TimerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Track a task. After `cancel_all` the task is aborted right away.
    pub(crate) fn register(&self, task: JoinHandle<()>) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if state.cancelled {
            task.abort();
            return;
        }
        state.tasks.retain(|task| !task.is_finished());
        state.tasks.push(task);
    }

    /// Abort every registered task. Returns how many were still running.
    pub(crate) fn cancel_all(&self) -> usize {
        let tasks = {
            let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            state.cancelled = true;
            std::mem::take(&mut state.tasks)
        };
        tasks
            .into_iter()
            .filter(|task| !task.is_finished())
            .inspect(|task| task.abort())
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.tasks.iter().filter(|task| !task.is_finished()).count()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn cancel_all_aborts_running_tasks() {
        let timers = TimerRegistry::new();
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let abort = task.abort_handle();
        timers.register(task);
        assert_eq!(timers.len(), 1);

        assert_eq!(timers.cancel_all(), 1);
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(abort.is_finished());
        assert_eq!(timers.len(), 0);
    }

    #[tokio::test]
    async fn register_after_cancel_aborts_immediately() {
        let timers = TimerRegistry::new();
        timers.cancel_all();

        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        let abort = task.abort_handle();
        timers.register(task);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(abort.is_finished());
        assert_eq!(timers.len(), 0);
    }
}
