//! Blocking wait primitives used by the pipeline stages
//!
//! Every suspension point in the pipeline is one of these two objects. Both
//! waits are bounded so a stage can re-check its exit flag even if a wake-up
//! is lost.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counting semaphore
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore with an initial count
    pub fn new(initial: u32) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Increment the count and wake one waiter
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_add(1);
        self.cond.notify_one();
    }

    /// Decrement the count, blocking up to `timeout` while it is zero.
    ///
    /// Returns false on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                if *count == 0 {
                    return false;
                }
                break;
            }
        }
        *count -= 1;
        true
    }

    /// Decrement without blocking
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            false
        } else {
            *count -= 1;
            true
        }
    }

    /// Current count
    pub fn count(&self) -> u32 {
        *self.count.lock()
    }

    /// Drop every outstanding post
    pub fn reset(&self) {
        *self.count.lock() = 0;
    }
}

/// Broadcast signal with a generation counter.
///
/// A waiter snapshots the generation before checking its condition and then
/// waits for the generation to move; a `signal()` issued in between is never
/// lost.
#[derive(Debug, Default)]
pub struct Event {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Event {
    /// Create a new event
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiter
    pub fn signal(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Generation to pass to `wait_since`
    pub fn snapshot(&self) -> u64 {
        *self.generation.lock()
    }

    /// Block until signalled after `seen` or until `timeout` elapses.
    ///
    /// Returns false on timeout.
    pub fn wait_since(&self, seen: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut generation = self.generation.lock();
        while *generation == seen {
            if self.cond.wait_until(&mut generation, deadline).timed_out() {
                return *generation != seen;
            }
        }
        true
    }
}
