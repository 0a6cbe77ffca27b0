//! Periodic background tasks.
//!
//! Discovery and polling each run on their own thread. The enabled flag is
//! checked at the top of every cycle: a disabled task keeps its schedule and
//! simply does nothing. Stopping is cooperative; [`PeriodicTask::signal_stop`]
//! wakes the thread and [`PeriodicTask::join`] waits for it.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

/// State shared between a task handle and its thread.
#[derive(Debug)]
pub struct TaskState {
    enabled: AtomicBool,
    stop_flag: AtomicBool,
    cycles: AtomicU64,
}

impl TaskState {
    fn new(enabled: bool) -> Self {
        TaskState {
            enabled: AtomicBool::new(enabled),
            stop_flag: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn should_stop(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed)
    }

    /// Number of enabled cycles run so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }
}

/// A named thread running a closure on a fixed interval.
pub struct PeriodicTask {
    name: String,
    state: Arc<TaskState>,
    thread_handle: Option<JoinHandle<()>>,
    interval: Duration,
}

impl PeriodicTask {
    /// Start a task.
    pub fn spawn<F>(name: &str, interval: Duration, enabled: bool, mut cycle: F) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let state = Arc::new(TaskState::new(enabled));
        let task_state = Arc::clone(&state);

        let thread_handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !task_state.should_stop() {
                    if task_state.is_enabled() {
                        cycle();
                        task_state.cycles.fetch_add(1, Ordering::Relaxed);
                    }
                    thread::park_timeout(interval);
                }
            })?;

        debug!(task = name, ?interval, enabled, "started periodic task");
        Ok(PeriodicTask {
            name: name.to_string(),
            state,
            thread_handle: Some(thread_handle),
            interval,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> &Arc<TaskState> {
        &self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state.is_enabled()
    }

    /// Enable or disable the task. Returns the previous setting.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.state.enabled.swap(enabled, Ordering::Relaxed)
    }

    pub fn cycles(&self) -> u64 {
        self.state.cycles()
    }

    /// Ask the thread to exit after its current cycle.
    pub fn signal_stop(&self) {
        self.state.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = &self.thread_handle {
            handle.thread().unpark();
        }
    }

    /// Wait for the thread to exit. Call [`Self::signal_stop`] first.
    pub fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!(task = %self.name, "periodic task panicked");
            }
        }
    }

    /// Signal stop and wait.
    pub fn stop(mut self) {
        self.signal_stop();
        self.join();
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.signal_stop();
        // Not joined here; the thread exits on its own.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn test_runs_cycles() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let task = PeriodicTask::spawn("test-runs", Duration::from_millis(1), true, move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        assert!(wait_for(|| count.load(Ordering::Relaxed) >= 3));
        task.stop();
    }

    #[test]
    fn test_disabled_task_is_idle() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let task = PeriodicTask::spawn("test-idle", Duration::from_millis(1), false, move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::Relaxed), 0);
        assert_eq!(task.cycles(), 0);

        assert!(!task.set_enabled(true));
        assert!(wait_for(|| count.load(Ordering::Relaxed) > 0));
        assert!(task.set_enabled(false));
        task.stop();
    }

    #[test]
    fn test_stop_wakes_long_interval() {
        let task = PeriodicTask::spawn("test-stop", Duration::from_secs(60), true, || {}).unwrap();
        assert!(wait_for(|| task.cycles() >= 1));

        let started = Instant::now();
        task.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
