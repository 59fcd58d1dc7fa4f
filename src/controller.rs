// Dispatch loop: walks the ascending prime stream, hands slices to idle
// workers, maintains the sieved-to watermark and writes periodic
// checkpoints. All blocking goes through the pool hand-off counters; the
// controller never spins on worker status.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::checkpoint::{self, FactorLog};
use crate::counter::SyncedCounter;
use crate::family::SequenceFamily;
use crate::primes::PrimeStream;
use crate::registry::TermRegistry;
use crate::worker::{MiniChunkRange, PoolSignals, WorkerState, WorkerUnit};

pub struct SieveConfig {
    pub min_prime: u64,
    pub max_prime: u64,
    pub cpu_threads: usize,
    pub cpu_work_size: usize,
    /// Below this prime, slices go out one at a time: small primes remove
    /// so many candidates that racing workers would mostly collide.
    pub serial_below: u64,
    /// Seconds between periodic checkpoints; 0 disables them (the final
    /// checkpoint is always written).
    pub checkpoint_seconds: u64,
    pub checkpoint_path: PathBuf,
    pub use_uring: bool,
}

/// Aggregated totals for the finished (or interrupted) run.
pub struct RunSummary {
    pub primes_tested: u64,
    pub factors_found: u64,
    pub largest_prime: u64,
    pub cpu_micros: u64,
    pub live_candidates: i64,
    pub interrupted: bool,
}

/// Round a requested bulk chunk size up to a whole number of test groups so
/// a vectorized kernel never sees a ragged tail it did not ask for.
pub fn round_up_work_size(requested: usize, group: usize) -> usize {
    requested.max(1).div_ceil(group) * group
}

/// How many idle workers a dispatch at `next` must wait for. Below the
/// serial threshold every worker must be parked, which serializes the
/// dense-elimination phase down to one in-flight slice.
pub fn idle_requirement(next: u64, serial_below: u64, active: usize) -> usize {
    if next < serial_below { active } else { 1 }
}

/// Slice length and kind for the next dispatch to one worker: a fixed group
/// while the next prime is inside the worker's declared mini sub-range,
/// a bulk chunk everywhere else.
fn slice_request(mini: Option<MiniChunkRange>, next: u64, chunk_size: usize) -> (usize, bool) {
    match mini {
        Some(range) if range.lo <= next && next < range.hi => (range.group, true),
        _ => (chunk_size, false),
    }
}

pub struct SieveController {
    config: SieveConfig,
    family: Arc<dyn SequenceFamily>,
    registry: Arc<dyn TermRegistry>,
    factors: Arc<FactorLog>,
    workers: Vec<WorkerUnit>,
    pool: Arc<PoolSignals>,
    interrupted: Arc<SyncedCounter>,
    stream: PrimeStream,
    /// Upper bound of the last slice handed out.
    dispatched_through: u64,
    /// Highest watermark ever reported; the watermark must never move
    /// backwards between checkpoints.
    watermark_floor: u64,
    next_worker: usize,
}

impl SieveController {
    pub fn new(
        config: SieveConfig,
        family: Arc<dyn SequenceFamily>,
        registry: Arc<dyn TermRegistry>,
        factors: Arc<FactorLog>,
        interrupted: Arc<SyncedCounter>,
    ) -> Self {
        if config.max_prime <= config.min_prime {
            eprintln!(
                "Error: prime range ({}, {}] is empty",
                config.min_prime, config.max_prime
            );
            std::process::exit(1);
        }

        let stream = PrimeStream::new(config.min_prime, config.max_prime);
        let dispatched_through = config.min_prime;
        let watermark_floor = config.min_prime;

        SieveController {
            config,
            family,
            registry,
            factors,
            workers: Vec::new(),
            pool: Arc::new(PoolSignals::new()),
            interrupted,
            stream,
            dispatched_through,
            watermark_floor,
            next_worker: 0,
        }
    }

    /// Spawn the CPU workers plus one device worker if the family can drive
    /// an accelerator. `resume_watermark` seeds every worker's completed
    /// bound so idle workers never drag the watermark below a prior run.
    pub fn create_workers(&mut self, resume_watermark: u64) {
        let work_size = round_up_work_size(self.config.cpu_work_size, 4);

        for id in 0..self.config.cpu_threads {
            let test = self
                .family
                .create_test(Arc::clone(&self.registry), Arc::clone(&self.factors));
            self.workers.push(WorkerUnit::spawn(
                id,
                test,
                Arc::clone(&self.pool),
                resume_watermark,
                work_size,
            ));
        }

        if let Some(probe) = self
            .family
            .device_probe(Arc::clone(&self.registry), Arc::clone(&self.factors))
        {
            let chunk_size = probe.chunk_size();
            self.workers.push(WorkerUnit::spawn(
                self.workers.len(),
                probe.test,
                Arc::clone(&self.pool),
                resume_watermark,
                chunk_size,
            ));
        }
    }

    pub fn run(&mut self) -> RunSummary {
        if self.workers.is_empty() {
            eprintln!("Error: run() called with no workers");
            std::process::exit(1);
        }
        let total = self.workers.len();

        // Every worker advertises itself once its resources exist; dispatch
        // starts only after the full pool is up
        self.pool
            .idle
            .wait_until(|n| (n as usize == total).then_some(()));

        let checkpoint_interval = Duration::from_secs(self.config.checkpoint_seconds);
        let progress_interval = Duration::from_secs(5);
        let mut next_checkpoint = Instant::now() + checkpoint_interval;
        let mut next_progress = Instant::now() + progress_interval;
        let mut interrupted = false;

        while let Some(next) = self.stream.peek() {
            if self.interrupted.value() != 0 {
                interrupted = true;
                break;
            }

            let need = idle_requirement(next, self.config.serial_below, total);

            // Park until enough workers are idle, waking periodically so
            // checkpoints and progress reports keep their cadence
            loop {
                let ready = self.pool.idle.wait_until_for(
                    |n| (n as usize >= need).then_some(()),
                    Duration::from_millis(200),
                );
                if ready.is_some() {
                    break;
                }
                self.maybe_checkpoint(&mut next_checkpoint, checkpoint_interval);
                self.maybe_report_progress(&mut next_progress, progress_interval);
                if self.interrupted.value() != 0 {
                    break;
                }
            }
            if self.interrupted.value() != 0 {
                interrupted = true;
                break;
            }

            let Some(idx) = self.claim_waiting_worker() else {
                continue;
            };

            let worker = &self.workers[idx];
            let (len, mini) = slice_request(worker.mini, next, worker.chunk_size);
            let Some(slice) = self.stream.next_slice(len, mini) else {
                break;
            };

            self.pool.idle.update(|n| n - 1);
            self.dispatched_through = slice.last();
            worker.assign(slice);

            self.maybe_checkpoint(&mut next_checkpoint, checkpoint_interval);
            self.maybe_report_progress(&mut next_progress, progress_interval);
        }

        // On interrupt the watermark is taken while in-flight slices are
        // still pending; they finish during shutdown but are not credited,
        // so a resume simply re-tests a little
        let final_watermark = if interrupted {
            self.watermark()
        } else {
            self.config.max_prime
        };

        self.stop_workers();
        self.write_checkpoint(final_watermark);

        self.summarize(interrupted)
    }

    /// Find a worker in WaitingForWork, scanning round-robin so dispatch
    /// spreads across the pool. The idle counter only rises after a worker
    /// enters WaitingForWork, so a positive count guarantees a hit.
    fn claim_waiting_worker(&mut self) -> Option<usize> {
        let total = self.workers.len();
        for offset in 0..total {
            let idx = (self.next_worker + offset) % total;
            if self.workers[idx].status() == WorkerState::WaitingForWork {
                self.next_worker = (idx + 1) % total;
                return Some(idx);
            }
        }
        None
    }

    /// Largest prime known to be fully sieved: the smallest completed bound
    /// among busy workers, or the dispatch frontier when nothing is in
    /// flight. Clamped so it never moves backwards.
    fn watermark(&mut self) -> u64 {
        let mut min_busy: Option<u64> = None;
        for worker in &self.workers {
            let status = worker.status();
            if status == WorkerState::HasWorkToDo || status == WorkerState::Working {
                let end = worker.lock_stats().last_slice_end;
                min_busy = Some(min_busy.map_or(end, |m| m.min(end)));
            }
        }
        let candidate = min_busy.unwrap_or(self.dispatched_through);
        self.watermark_floor = self.watermark_floor.max(candidate);
        self.watermark_floor
    }

    fn maybe_checkpoint(&mut self, next: &mut Instant, interval: Duration) {
        if self.config.checkpoint_seconds == 0 || Instant::now() < *next {
            return;
        }
        let watermark = self.watermark();
        self.write_checkpoint(watermark);
        *next = Instant::now() + interval;
    }

    fn write_checkpoint(&self, watermark: u64) {
        // Watermark was computed before the snapshot, so every listed
        // survivor reflects at least the primes up to the watermark
        let snapshot = self.registry.snapshot();
        match checkpoint::write_checkpoint(
            &self.config.checkpoint_path,
            self.family.as_ref(),
            watermark,
            &snapshot.keys,
            self.config.use_uring,
        ) {
            Ok(written) => {
                println!(
                    "Checkpoint: sieved to {}, {} terms remain",
                    watermark, written
                );
            }
            Err(e) => {
                eprintln!(
                    "Warning: could not write checkpoint {}: {}",
                    self.config.checkpoint_path.display(),
                    e
                );
            }
        }
    }

    fn maybe_report_progress(&mut self, next: &mut Instant, interval: Duration) {
        if Instant::now() < *next {
            return;
        }
        let mut primes_tested = 0_u64;
        let mut factors_found = 0_u64;
        for worker in &self.workers {
            let stats = worker.lock_stats();
            primes_tested += stats.primes_tested;
            factors_found += stats.factors_found;
        }
        println!(
            "p: {}, {} primes tested, {} factors found, {} terms remain",
            self.dispatched_through,
            primes_tested,
            factors_found,
            self.registry.live_count()
        );
        *next = Instant::now() + interval;
    }

    fn stop_workers(&mut self) {
        for worker in &self.workers {
            worker.request_stop();
        }
        let total = self.workers.len() as i64;
        self.pool.stopped.wait_until(|n| (n >= total).then_some(()));
        for worker in &mut self.workers {
            worker.join();
        }
    }

    fn summarize(&self, interrupted: bool) -> RunSummary {
        let mut summary = RunSummary {
            primes_tested: 0,
            factors_found: 0,
            largest_prime: 0,
            cpu_micros: 0,
            live_candidates: self.registry.live_count(),
            interrupted,
        };
        for worker in &self.workers {
            let stats = worker.lock_stats();
            summary.primes_tested += stats.primes_tested;
            summary.factors_found += stats.factors_found;
            summary.cpu_micros += stats.cpu_micros;
            if stats.largest_prime > summary.largest_prime {
                summary.largest_prime = stats.largest_prime;
            }
        }
        summary
    }
}
