use std::sync::{Condvar, Mutex, MutexGuard};

/// Protected 64-bit counter, the basic cross-thread value cell.
///
/// Every logical flag or statistic gets its own instance; instances are never
/// shared between unrelated components. A poisoned lock means another thread
/// died inside a critical section, which is a programming error — we print a
/// diagnostic and exit instead of deadlocking or limping on.
pub struct SyncedCounter {
    value: Mutex<i64>,
}

impl SyncedCounter {
    pub fn new(initial: i64) -> Self {
        SyncedCounter {
            value: Mutex::new(initial),
        }
    }

    /// Acquire the lock for a grouped read/modify/write sequence.
    /// The guard releases on drop.
    pub fn lock(&self) -> MutexGuard<'_, i64> {
        lock_or_die(&self.value)
    }

    /// Single locked read.
    pub fn value(&self) -> i64 {
        *self.lock()
    }

    /// Single locked write.
    pub fn set_value(&self, v: i64) {
        *self.lock() = v;
    }

    /// Locked read-modify-write; returns the new value.
    pub fn increment(&self) -> i64 {
        let mut guard = self.lock();
        *guard += 1;
        *guard
    }

    /// Locked read-modify-write; returns the new value.
    pub fn decrement(&self) -> i64 {
        let mut guard = self.lock();
        *guard -= 1;
        *guard
    }
}

/// Protected value cell plus a wait/notify channel.
///
/// This is the only blocking hand-off mechanism in the engine: a worker parks
/// in `wait_until` until the controller stores a new state, and the pool
/// counters park the controller until a worker becomes idle or stops. Kept
/// separate from SyncedCounter so plain counters do not pay for a Condvar
/// they never use.
pub struct HandOff<T> {
    cell: Mutex<T>,
    cond: Condvar,
}

impl<T: Copy + PartialEq> HandOff<T> {
    pub fn new(initial: T) -> Self {
        HandOff {
            cell: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn get(&self) -> T {
        *lock_or_die(&self.cell)
    }

    /// Store a new value and wake all waiters.
    pub fn set(&self, v: T) {
        *lock_or_die(&self.cell) = v;
        self.cond.notify_all();
    }

    /// Locked read-modify-write; wakes all waiters and returns the new value.
    pub fn update(&self, f: impl FnOnce(T) -> T) -> T {
        let mut guard = lock_or_die(&self.cell);
        *guard = f(*guard);
        let v = *guard;
        drop(guard);
        self.cond.notify_all();
        v
    }

    /// Store `to` only if the current value is `from`; returns the value
    /// observed before the attempt. Waiters are woken on success.
    pub fn transition(&self, from: T, to: T) -> T {
        let mut guard = lock_or_die(&self.cell);
        let seen = *guard;
        if seen == from {
            *guard = to;
            drop(guard);
            self.cond.notify_all();
        }
        seen
    }

    /// Like `wait_until`, but gives up after `timeout` and returns None so
    /// the caller can attend to periodic duties before parking again.
    pub fn wait_until_for<R>(
        &self,
        mut pred: impl FnMut(T) -> Option<R>,
        timeout: std::time::Duration,
    ) -> Option<R> {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = lock_or_die(&self.cell);
        loop {
            if let Some(r) = pred(*guard) {
                return Some(r);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            guard = match self.cond.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(_) => {
                    eprintln!("Error: condition wait on poisoned lock (a thread died mid-update)");
                    std::process::exit(1);
                }
            };
        }
    }

    /// Block until `pred` yields a result for the current value.
    pub fn wait_until<R>(&self, mut pred: impl FnMut(T) -> Option<R>) -> R {
        let mut guard = lock_or_die(&self.cell);
        loop {
            if let Some(r) = pred(*guard) {
                return r;
            }
            guard = match self.cond.wait(guard) {
                Ok(g) => g,
                Err(_) => {
                    eprintln!("Error: condition wait on poisoned lock (a thread died mid-update)");
                    std::process::exit(1);
                }
            };
        }
    }
}

fn lock_or_die<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(_) => {
            eprintln!("Error: lock poisoned (a thread died inside a critical section)");
            std::process::exit(1);
        }
    }
}
