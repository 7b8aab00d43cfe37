//! Manual-reset event used as an external stop signal.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A cloneable manual-reset event.
///
/// Once [`set`](DownloadEvent::set), the event stays signaled until
/// [`unset`](DownloadEvent::unset) is called; every waiter observes the
/// signaled state. A clone shares the underlying state, so the same event can
/// be handed to several sessions as a common stop signal.
#[derive(Debug, Clone, Default)]
pub struct DownloadEvent {
    inner: Arc<EventInner>,
}

#[derive(Debug, Default)]
struct EventInner {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl DownloadEvent {
    /// Create a new event in the unsignaled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event, waking all current and future waiters.
    pub fn set(&self) {
        let mut flag = self.inner.flag.lock();
        *flag = true;
        self.inner.cond.notify_all();
    }

    /// Reset the event to the unsignaled state.
    pub fn unset(&self) {
        let mut flag = self.inner.flag.lock();
        *flag = false;
    }

    /// Whether the event is currently signaled.
    pub fn is_set(&self) -> bool {
        *self.inner.flag.lock()
    }

    /// Block until the event is signaled or the timeout elapses.
    ///
    /// Returns `true` if the event was signaled, `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut flag = self.inner.flag.lock();
        if *flag {
            return true;
        }
        self.inner.cond.wait_for(&mut flag, timeout);
        *flag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_event_starts_unset() {
        let event = DownloadEvent::new();
        assert!(!event.is_set());
    }

    #[test]
    fn test_set_and_unset() {
        let event = DownloadEvent::new();
        event.set();
        assert!(event.is_set());
        event.unset();
        assert!(!event.is_set());
    }

    #[test]
    fn test_wait_times_out() {
        let event = DownloadEvent::new();
        assert!(!event.wait(Duration::from_millis(20)));
    }

    #[test]
    fn test_wait_wakes_on_set() {
        let event = DownloadEvent::new();
        let clone = event.clone();

        let waiter = thread::spawn(move || clone.wait(Duration::from_secs(5)));

        thread::sleep(Duration::from_millis(20));
        event.set();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_clone_shares_state() {
        let event = DownloadEvent::new();
        let clone = event.clone();
        clone.set();
        assert!(event.is_set());
    }
}
