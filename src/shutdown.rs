//! Process-wide cancellation token.
//!
//! The signal handler calls [`Shutdown::request`]; every blocking wait in the
//! pipeline (stabilization hold, subprocess polling, inter-capture sleep,
//! retry backoff, GPS polling) goes through [`Shutdown::wait_timeout`] so a
//! request wakes it immediately.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    requested: Mutex<bool>,
    cvar: Condvar,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark shutdown as requested and wake every waiter.
    pub fn request(&self) {
        let mut requested = self.lock();
        *requested = true;
        self.inner.cvar.notify_all();
    }

    pub fn is_requested(&self) -> bool {
        *self.lock()
    }

    /// Block for up to `timeout`.
    ///
    /// Returns `true` if shutdown was requested before the timeout elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut requested = self.lock();
        loop {
            if *requested {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            requested = match self.inner.cvar.wait_timeout(requested, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.inner
            .requested
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
