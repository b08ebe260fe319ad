use std::sync::{Condvar, Mutex, PoisonError};

/// Counting wake primitive, one per state record.
///
/// Construction seeds a single permit so the owning worker processes its
/// initial transition without anybody posting first. Components that write a
/// new target state call [`Wake::post`]; the worker blocks in [`Wake::wait`]
/// until at least one permit is pending.
pub struct Wake {
    count: Mutex<u64>,
    ready: Condvar,
}

impl Wake {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(1),
            ready: Condvar::new(),
        }
    }

    /// Increment the pending count and release at most one waiter.
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.ready.notify_one();
    }

    /// Block until a permit is pending, then consume it.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            count = self
                .ready
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> u64 {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Wake {
    fn default() -> Self {
        Self::new()
    }
}
