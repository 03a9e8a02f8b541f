use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Counting semaphore that never holds more than its initial permits.
#[derive(Debug)]
pub struct BoundedSemaphore {
    permits: Mutex<usize>,
    max: usize,
    available: Condvar,
}

impl BoundedSemaphore {
    pub fn new(max: usize) -> Self {
        Self {
            permits: Mutex::new(max),
            max,
            available: Condvar::new(),
        }
    }

    /// Take a permit, waiting at most `timeout`. Returns false on timeout.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.available.wait_until(&mut permits, deadline).timed_out() && *permits == 0 {
                return false;
            }
        }
        *permits -= 1;
        true
    }

    pub fn release(&self) {
        let mut permits = self.permits.lock();
        debug_assert!(*permits < self.max, "semaphore released too many times");
        if *permits < self.max {
            *permits += 1;
        }
        self.available.notify_one();
    }
}

/// A held permit; released when dropped, on every exit path of the holder.
#[derive(Debug)]
pub struct Permit {
    semaphore: Arc<BoundedSemaphore>,
}

impl Permit {
    /// Wrap a permit already taken with [`BoundedSemaphore::acquire_timeout`].
    pub fn adopt(semaphore: Arc<BoundedSemaphore>) -> Self {
        Self { semaphore }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}
