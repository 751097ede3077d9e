use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

use super::SessionManager;

/// Background thread running [`SessionManager::cleanup_idle`] on an interval.
///
/// The loop ends when [`CleanupLoop::stop`] is called, when the handle is
/// dropped, or when the manager itself is dropped.
#[derive(Debug)]
pub struct CleanupLoop {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CleanupLoop {
    pub(super) fn spawn(manager: Weak<SessionManager>, interval: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            debug!(interval_secs = interval.as_secs_f64(), "session:cleanup loop started");
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let removed = manager.cleanup_idle();
                if removed > 0 {
                    info!(removed, "session:idle sweep");
                }
            }
            debug!("session:cleanup loop stopped");
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    /// Stop the loop and wait for an in-progress sweep to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CleanupLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SessionManager {
    /// Sweep idle sessions every `interval` until the returned handle is
    /// stopped or dropped.
    pub fn start_cleanup_loop(self: &Arc<Self>, interval: Duration) -> CleanupLoop {
        CleanupLoop::spawn(Arc::downgrade(self), interval)
    }
}
