//! Process-wide shutdown signal shared by the background loops.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// One-way latch: once triggered it stays triggered. Loops use
/// [`Shutdown::sleep`] instead of `thread::sleep` so they wake immediately
/// when the process is asked to stop.
pub struct Shutdown {
    triggered: Mutex<bool>,
    cv: Condvar,
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown {
            triggered: Mutex::new(false),
            cv: Condvar::new(),
        }
    }
}

impl Shutdown {
    pub fn trigger(&self) {
        let mut guard = self.triggered.lock().unwrap_or_else(|e| e.into_inner());
        *guard = true;
        self.cv.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block for up to `timeout`, returning early when shutdown fires.
    /// Returns true when shutdown was triggered.
    pub fn sleep(&self, timeout: Duration) -> bool {
        let guard = self.triggered.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .cv
            .wait_timeout_while(guard, timeout, |triggered| !*triggered)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn sleep_returns_false_on_plain_timeout() {
        let shutdown = Shutdown::default();
        assert!(!shutdown.sleep(Duration::from_millis(5)));
        assert!(!shutdown.is_triggered());
    }

    #[test]
    fn trigger_wakes_a_sleeping_thread() {
        let shutdown = Arc::new(Shutdown::default());
        let waiter = Arc::clone(&shutdown);
        let handle = thread::spawn(move || waiter.sleep(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(10));
        shutdown.trigger();
        assert!(handle.join().unwrap());
        assert!(shutdown.is_triggered());
    }
}
