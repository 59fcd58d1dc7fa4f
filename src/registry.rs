use std::sync::Mutex;

/// Shared candidate registry contract.
///
/// One bit per candidate, one coarse lock, first-writer-wins mutation. Any
/// concrete registry a sequence family supplies must keep these semantics:
/// `report_factor`/`report_prime` test-and-clear the candidate's bit and
/// return true for exactly one of any set of concurrent callers, so
/// overlapping chunk work and multiple dividing primes for the same
/// candidate are absorbed, not errors.
pub trait TermRegistry: Send + Sync {
    /// Pre-run factor replay. Same check-and-clear semantics as
    /// `report_factor`, called only before any worker exists (the lock is
    /// uncontended by construction).
    fn apply_factor(&self, prime: u64, key: u64) -> bool;

    /// Concurrent check-and-clear. True only for the caller that actually
    /// cleared the bit; a false return means some other prime or worker got
    /// there first and nothing was mutated.
    fn report_factor(&self, prime: u64, key: u64) -> bool;

    /// Same as `report_factor`, for the case where the candidate's own value
    /// is the prime being tested (the candidate is certified prime rather
    /// than merely factored).
    fn report_prime(&self, prime: u64, key: u64) -> bool;

    fn live_count(&self) -> i64;

    fn size(&self) -> u64;

    /// Consistent copy of the surviving candidates, taken under the lock.
    /// Recomputes the population count and dies if it disagrees with the
    /// tracked live count: once that invariant breaks the registry cannot be
    /// trusted and continuing could silently emit wrong results.
    fn snapshot(&self) -> RegistrySnapshot;
}

pub struct RegistrySnapshot {
    pub live: i64,
    pub keys: Vec<u64>,
}

/// Dense bit-vector registry: key k lives in bit k.
pub struct BitmapRegistry {
    inner: Mutex<Inner>,
    size: u64,
}

struct Inner {
    bits: Vec<u64>,
    live: i64,
}

impl BitmapRegistry {
    /// Fresh registry with all `size` candidates alive.
    pub fn new_all_alive(size: u64) -> Self {
        let words = (size as usize).div_ceil(64);
        let mut bits = vec![!0_u64; words];

        // Clear the unused tail bits of the last word
        let tail = (size % 64) as u32;
        if tail != 0 {
            if let Some(last) = bits.last_mut() {
                *last &= (1_u64 << tail) - 1;
            }
        }

        BitmapRegistry {
            inner: Mutex::new(Inner {
                bits,
                live: size as i64,
            }),
            size,
        }
    }

    /// Registry replayed from a checkpoint: only the listed keys are alive.
    pub fn from_survivors(size: u64, survivors: &[u64]) -> Self {
        let words = (size as usize).div_ceil(64);
        let mut bits = vec![0_u64; words];
        let mut live = 0_i64;

        for &key in survivors {
            if key >= size {
                eprintln!("Error: checkpoint candidate key {} out of range (size {})", key, size);
                std::process::exit(1);
            }
            let word_idx = (key / 64) as usize;
            let bit = 1_u64 << (key % 64);
            if bits[word_idx] & bit == 0 {
                bits[word_idx] |= bit;
                live += 1;
            }
        }

        BitmapRegistry {
            inner: Mutex::new(Inner { bits, live }),
            size,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => {
                eprintln!("Error: candidate registry lock poisoned");
                std::process::exit(1);
            }
        }
    }

    /// Check-and-clear under the lock; the one dedup primitive.
    fn check_and_clear(&self, key: u64) -> bool {
        if key >= self.size {
            eprintln!("Error: candidate key {} out of range (size {})", key, self.size);
            std::process::exit(1);
        }

        let mut inner = self.lock();
        let word_idx = (key / 64) as usize;
        let bit = 1_u64 << (key % 64);

        if inner.bits[word_idx] & bit == 0 {
            return false; // Already eliminated by an earlier writer
        }

        inner.bits[word_idx] &= !bit;
        inner.live -= 1;
        true
    }
}

impl TermRegistry for BitmapRegistry {
    fn apply_factor(&self, _prime: u64, key: u64) -> bool {
        self.check_and_clear(key)
    }

    fn report_factor(&self, _prime: u64, key: u64) -> bool {
        self.check_and_clear(key)
    }

    fn report_prime(&self, _prime: u64, key: u64) -> bool {
        self.check_and_clear(key)
    }

    fn live_count(&self) -> i64 {
        self.lock().live
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.lock();

        // Independent recount; a mismatch with the tracked live count is an
        // invariant violation and fatal
        let popcount: i64 = inner.bits.iter().map(|w| w.count_ones() as i64).sum();
        if popcount != inner.live {
            eprintln!(
                "Error: registry live count {} does not match population count {} - aborting",
                inner.live, popcount
            );
            std::process::exit(1);
        }

        let mut keys = Vec::with_capacity(popcount as usize);
        for (word_idx, &w) in inner.bits.iter().enumerate() {
            let mut word = w;
            while word != 0 {
                let bit_idx = word.trailing_zeros() as usize;
                keys.push((word_idx * 64 + bit_idx) as u64);
                word &= word - 1; // Clear lowest set bit
            }
        }

        RegistrySnapshot {
            live: inner.live,
            keys,
        }
    }
}
