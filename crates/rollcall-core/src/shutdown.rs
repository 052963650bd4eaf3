//! Operator shutdown signal shared between the signal handler and the
//! blocking verification loop.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Clone-safe shutdown flag. Waiters wake as soon as it is triggered.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown and wake every waiter.
    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for up to `duration`. Returns `true` if shutdown was requested
    /// before or during the wait. A duration past the end of the clock
    /// waits for shutdown alone.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now().checked_add(duration);
        let (lock, cvar) = &*self.inner;
        let mut triggered = lock.lock().unwrap_or_else(PoisonError::into_inner);

        while !*triggered {
            triggered = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    cvar.wait_timeout(triggered, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => cvar.wait(triggered).unwrap_or_else(PoisonError::into_inner),
            };
        }
        true
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_elapses_without_trigger() {
        let s = Shutdown::new();
        assert!(!s.wait_timeout(Duration::from_millis(10)));
        assert!(!s.is_triggered());
    }

    #[test]
    fn test_wait_returns_immediately_when_triggered() {
        let s = Shutdown::new();
        s.trigger();
        let start = Instant::now();
        assert!(s.wait_timeout(Duration::from_secs(30)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_trigger_wakes_waiter_on_other_thread() {
        let s = Shutdown::new();
        let waiter = s.clone();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        s.trigger();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_unbounded_wait_ends_on_trigger() {
        let s = Shutdown::new();
        let waiter = s.clone();
        let handle =
            std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(u64::MAX)));
        std::thread::sleep(Duration::from_millis(20));
        s.trigger();
        assert!(handle.join().unwrap());
    }
}
