use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::counter::HandOff;
use crate::primes::PrimeSlice;

/// Worker lifecycle. Initializing is held until the test routine's fixed
/// resources exist; Stopping is set externally and observed only at slice
/// boundaries; Stopped is terminal.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WorkerState {
    Initializing,
    WaitingForWork,
    HasWorkToDo,
    Working,
    Stopping,
    Stopped,
}

/// Sub-range of the prime stream a test routine wants fed in fixed groups of
/// `group` primes for its vectorized path. Outside [lo, hi) the worker gets
/// bulk mega chunks instead.
#[derive(Clone, Copy)]
pub struct MiniChunkRange {
    pub lo: u64,
    pub hi: u64,
    pub group: usize,
}

/// What one chunk of work produced, folded into the worker's statistics.
#[derive(Default)]
pub struct ChunkOutcome {
    pub primes_tested: u64,
    pub factors_found: u64,
}

/// Per-sequence numeric test routine, plugged into a WorkerUnit.
///
/// Both entry points must return identical factor/non-factor verdicts for
/// the same prime and candidate; the mini/mega split is purely a throughput
/// knob. The routine mutates shared state only through the TermRegistry
/// contract and never touches another worker's state.
pub trait SieveTest: Send {
    fn test_mega_prime_chunk(&mut self, primes: &[u64]) -> ChunkOutcome;

    /// Called only for tests that declare a mini-chunk range. Calling it on
    /// one that does not is a programming error in the dispatcher, not a
    /// recoverable condition.
    fn test_mini_prime_chunk(&mut self, _primes: &[u64]) -> ChunkOutcome {
        eprintln!("Error: mini-chunk dispatched to a test routine that declares no mini range");
        std::process::exit(1);
    }

    fn mini_chunk_range(&self) -> Option<MiniChunkRange> {
        None
    }

    fn clean_up(&mut self) {}
}

/// Locked statistics group. The controller reads several fields as one
/// consistent unit through `WorkerUnit::lock_stats`.
pub struct WorkerStats {
    pub primes_tested: u64,
    pub largest_prime: u64,
    pub factors_found: u64,
    pub cpu_micros: u64,
    pub slices_done: u64,
    /// Upper bound of the last fully completed slice; starts at the resume
    /// watermark so an idle worker never drags the pool watermark below it.
    pub last_slice_end: u64,
}

/// Pool-wide wake-up counters: workers bump `idle` when they reach
/// WaitingForWork and `stopped` when they terminate, and the controller
/// parks on them instead of polling.
pub struct PoolSignals {
    pub idle: HandOff<i64>,
    pub stopped: HandOff<i64>,
}

impl PoolSignals {
    pub fn new() -> Self {
        PoolSignals {
            idle: HandOff::new(0),
            stopped: HandOff::new(0),
        }
    }
}

struct WorkerShared {
    status: HandOff<WorkerState>,
    slice: Mutex<Option<PrimeSlice>>,
    stats: Mutex<WorkerStats>,
}

/// One background thread executing a pluggable test routine against the
/// prime slices the controller hands it.
pub struct WorkerUnit {
    pub id: usize,
    /// Bulk chunk size for this worker (CPU work size, or the device's
    /// work-group size x group count for a device worker).
    pub chunk_size: usize,
    pub mini: Option<MiniChunkRange>,
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerUnit {
    pub fn spawn(
        id: usize,
        mut test: Box<dyn SieveTest>,
        pool: Arc<PoolSignals>,
        resume_watermark: u64,
        chunk_size: usize,
    ) -> Self {
        let mini = test.mini_chunk_range();

        let shared = Arc::new(WorkerShared {
            status: HandOff::new(WorkerState::Initializing),
            slice: Mutex::new(None),
            stats: Mutex::new(WorkerStats {
                primes_tested: 0,
                largest_prime: 0,
                factors_found: 0,
                cpu_micros: 0,
                slices_done: 0,
                last_slice_end: resume_watermark,
            }),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::spawn(move || {
            worker_loop(&thread_shared, &pool, test.as_mut());
            test.clean_up();
            thread_shared.status.set(WorkerState::Stopped);
            pool.stopped.update(|n| n + 1);
        });

        WorkerUnit {
            id,
            chunk_size,
            mini,
            shared,
            handle: Some(handle),
        }
    }

    pub fn status(&self) -> WorkerState {
        self.shared.status.get()
    }

    /// Hand a slice to a waiting worker. Claiming a worker that is not
    /// WaitingForWork is a dispatcher bug and fatal.
    pub fn assign(&self, slice: PrimeSlice) {
        {
            let mut pending = match self.shared.slice.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    eprintln!("Error: worker {} slice lock poisoned", self.id);
                    std::process::exit(1);
                }
            };
            *pending = Some(slice);
        }

        let prior = self
            .shared
            .status
            .transition(WorkerState::WaitingForWork, WorkerState::HasWorkToDo);
        if prior != WorkerState::WaitingForWork {
            eprintln!(
                "Error: dispatched work to worker {} in state {:?}",
                self.id, prior
            );
            std::process::exit(1);
        }
    }

    /// Ask the worker to stop at its next slice boundary. An in-flight or
    /// already-assigned slice always completes; the thread never aborts
    /// mid-slice and never abandons dispatched work.
    pub fn request_stop(&self) {
        loop {
            let current = self.shared.status.get();
            if current == WorkerState::Stopped || current == WorkerState::Stopping {
                return;
            }
            if self.shared.status.transition(current, WorkerState::Stopping) == current {
                return;
            }
        }
    }

    pub fn lock_stats(&self) -> MutexGuard<'_, WorkerStats> {
        match self.shared.stats.lock() {
            Ok(guard) => guard,
            Err(_) => {
                eprintln!("Error: worker {} stats lock poisoned", self.id);
                std::process::exit(1);
            }
        }
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                eprintln!("Error: worker {} thread panicked", self.id);
                std::process::exit(1);
            }
        }
    }
}

fn worker_loop(shared: &WorkerShared, pool: &PoolSignals, test: &mut dyn SieveTest) {
    // Resources were allocated when the test routine was constructed, so
    // Initializing ends here and the worker advertises itself
    shared.status.set(WorkerState::WaitingForWork);
    pool.idle.update(|n| n + 1);

    loop {
        let state = shared.status.wait_until(|s| {
            (s == WorkerState::HasWorkToDo || s == WorkerState::Stopping).then_some(s)
        });

        let slice = match shared.slice.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => {
                eprintln!("Error: worker slice lock poisoned");
                std::process::exit(1);
            }
        };

        // A stop request can land with a slice already assigned; the slice
        // is still honored so nothing dispatched is ever dropped
        let Some(slice) = slice else {
            if state == WorkerState::Stopping {
                break;
            }
            eprintln!("Error: worker woken with no slice assigned");
            std::process::exit(1);
        };

        // Claim the slice. A stop request that lands between the wake-up and
        // this claim must stay in place, so Working is entered by transition,
        // never by a blind store
        let stopping = state == WorkerState::Stopping
            || shared
                .status
                .transition(WorkerState::HasWorkToDo, WorkerState::Working)
                == WorkerState::Stopping;

        let started = Instant::now();
        let outcome = if slice.mini {
            test.test_mini_prime_chunk(&slice.primes)
        } else {
            test.test_mega_prime_chunk(&slice.primes)
        };
        let elapsed = started.elapsed();

        {
            let mut stats = match shared.stats.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    eprintln!("Error: worker stats lock poisoned");
                    std::process::exit(1);
                }
            };
            stats.primes_tested += outcome.primes_tested;
            stats.factors_found += outcome.factors_found;
            stats.cpu_micros += elapsed.as_micros() as u64;
            stats.slices_done += 1;
            if slice.last() > stats.largest_prime {
                stats.largest_prime = slice.last();
            }
            stats.last_slice_end = slice.last();
        }

        // Stop requests are only observed here, at the slice boundary
        if stopping {
            break;
        }
        let prior = shared
            .status
            .transition(WorkerState::Working, WorkerState::WaitingForWork);
        if prior == WorkerState::Stopping {
            break;
        }
        pool.idle.update(|n| n + 1);
    }
}
