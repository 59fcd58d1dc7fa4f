// k*b^n+c sequence family.
//
// A prime p divides k*b^n+c exactly when k*(b^n mod p)+c = 0 (mod p), so
// each prime is tested by walking b^n mod p incrementally across the whole
// candidate range. Every discovered factor is re-verified with exact
// arbitrary-precision arithmetic before it may touch the registry.

use rug::Integer;
use std::sync::Arc;

use crate::checkpoint::FactorLog;
use crate::family::{SequenceFamily, add_mod, mul_mod, pow_mod};
use crate::registry::{BitmapRegistry, TermRegistry};
use crate::worker::{ChunkOutcome, MiniChunkRange, SieveTest};

#[derive(Clone, Copy)]
pub struct KbnFamily {
    k: u64,
    b: u64,
    c: i64,
    n_min: u64,
    n_max: u64,
    /// Below this prime the controller feeds groups of 4 to the batched
    /// path; 0 disables mini-chunking entirely.
    vector_below: u64,
}

impl KbnFamily {
    pub fn new(k: u64, b: u64, c: i64, n_min: u64, n_max: u64, vector_below: u64) -> Self {
        if k == 0 {
            eprintln!("Error: k must be at least 1");
            std::process::exit(1);
        }
        if b < 2 || b > u32::MAX as u64 {
            eprintln!("Error: b must be in 2..{}", u32::MAX);
            std::process::exit(1);
        }
        if c == 0 {
            eprintln!("Error: c must be non-zero");
            std::process::exit(1);
        }
        if n_max < n_min || n_max > u32::MAX as u64 {
            eprintln!("Error: need nmin <= nmax <= {}", u32::MAX);
            std::process::exit(1);
        }

        let family = KbnFamily {
            k,
            b,
            c,
            n_min,
            n_max,
            vector_below,
        };

        // The smallest term bounds all others (monotone in n); anything
        // below 2 would make "factor" meaningless
        if family.exact_integer(n_min) < 2 {
            eprintln!("Error: {} is below 2; adjust k, c or nmin", family.candidate_term(0));
            std::process::exit(1);
        }

        family
    }

    /// Exact term value, for factor verification.
    fn exact_integer(&self, n: u64) -> Integer {
        let mut value = Integer::from(Integer::u_pow_u(self.b as u32, n as u32));
        value *= self.k;
        value += self.c;
        value
    }

    /// Exact term value when it fits in a u128; used to recognize the case
    /// where the tested prime IS the candidate's value.
    fn exact_value_u128(&self, n: u64) -> Option<u128> {
        if n >= 128 {
            return None;
        }
        let mut pow: u128 = 1;
        for _ in 0..n {
            pow = pow.checked_mul(self.b as u128)?;
        }
        let value = pow.checked_mul(self.k as u128)?;
        if self.c >= 0 {
            value.checked_add(self.c as u128)
        } else {
            value.checked_sub(self.c.unsigned_abs() as u128)
        }
    }

    fn term_prefix(&self) -> String {
        format!("{}*{}^", self.k, self.b)
    }
}

impl SequenceFamily for KbnFamily {
    fn name(&self) -> &'static str {
        "kbn"
    }

    fn form(&self) -> String {
        if self.c >= 0 {
            format!("{}*{}^n+{}", self.k, self.b, self.c)
        } else {
            format!("{}*{}^n-{}", self.k, self.b, -self.c)
        }
    }

    fn candidate_count(&self) -> u64 {
        self.n_max - self.n_min + 1
    }

    fn push_candidate(&self, key: u64, out: &mut String) {
        let n = self.n_min + key;
        let mut itoa_buf = itoa::Buffer::new();
        out.push_str(itoa_buf.format(self.k));
        out.push('*');
        out.push_str(itoa_buf.format(self.b));
        out.push('^');
        out.push_str(itoa_buf.format(n));
        if self.c >= 0 {
            out.push('+');
            out.push_str(itoa_buf.format(self.c));
        } else {
            out.push('-');
            out.push_str(itoa_buf.format(-self.c));
        }
    }

    fn parse_candidate(&self, term: &str) -> Option<u64> {
        let rest = term.strip_prefix(&self.term_prefix())?;
        let sign_pos = rest.find(['+', '-'])?;
        let (n_text, c_text) = rest.split_at(sign_pos);
        let n: u64 = n_text.parse().ok()?;
        let c: i64 = c_text.parse().ok()?;
        if c != self.c || n < self.n_min || n > self.n_max {
            return None;
        }
        Some(n - self.n_min)
    }

    fn create_registry(&self, survivors: Option<&[u64]>) -> Arc<dyn TermRegistry> {
        match survivors {
            Some(keys) => Arc::new(BitmapRegistry::from_survivors(self.candidate_count(), keys)),
            None => Arc::new(BitmapRegistry::new_all_alive(self.candidate_count())),
        }
    }

    fn create_test(
        &self,
        registry: Arc<dyn TermRegistry>,
        factors: Arc<FactorLog>,
    ) -> Box<dyn SieveTest> {
        Box::new(KbnTest {
            family: *self,
            registry,
            factors,
            hits: Vec::new(),
        })
    }
}

struct KbnTest {
    family: KbnFamily,
    registry: Arc<dyn TermRegistry>,
    factors: Arc<FactorLog>,
    hits: Vec<(u64, u64)>, // (prime, n), refilled per chunk
}

impl KbnTest {
    /// Test up to 4 primes together, lanes advancing in lockstep. This is
    /// the batched kernel behind both chunk entry points, which is what
    /// makes their verdicts identical by construction.
    fn scan_batch(&mut self, primes: &[u64]) {
        let len = primes.len().min(4);
        let mut pw = [0_u64; 4];
        let mut bm = [0_u64; 4];
        let mut km = [0_u64; 4];
        let mut cm = [0_u64; 4];

        for i in 0..len {
            let p = primes[i];
            bm[i] = self.family.b % p;
            km[i] = self.family.k % p;
            cm[i] = (self.family.c as i128).rem_euclid(p as i128) as u64;
            pw[i] = pow_mod(self.family.b, self.family.n_min, p);
        }

        for n in self.family.n_min..=self.family.n_max {
            for i in 0..len {
                let p = primes[i];
                let v = add_mod(mul_mod(km[i], pw[i], p), cm[i], p);
                if v == 0 {
                    self.hits.push((p, n));
                }
                pw[i] = mul_mod(pw[i], bm[i], p);
            }
        }
    }

    fn scan_one(&mut self, p: u64) {
        let bm = self.family.b % p;
        let km = self.family.k % p;
        let cm = (self.family.c as i128).rem_euclid(p as i128) as u64;
        let mut pw = pow_mod(self.family.b, self.family.n_min, p);

        for n in self.family.n_min..=self.family.n_max {
            let v = add_mod(mul_mod(km, pw, p), cm, p);
            if v == 0 {
                self.hits.push((p, n));
            }
            pw = mul_mod(pw, bm, p);
        }
    }

    /// Verify and report the chunk's hits; returns how many candidates this
    /// call actually eliminated (dedup losers are not counted).
    fn report_hits(&mut self) -> u64 {
        let hits = std::mem::take(&mut self.hits);
        let mut found = 0_u64;

        for &(p, n) in &hits {
            let key = n - self.family.n_min;
            let term = self.family.candidate_term(key);

            // A factor that does not verify means the modular walk is wrong
            // and nothing the registry now contains can be trusted
            if !self.family.exact_integer(n).is_divisible(&Integer::from(p)) {
                eprintln!("Error: verification failed: {} does not divide {}", p, term);
                std::process::exit(1);
            }

            if self.family.exact_value_u128(n) == Some(p as u128) {
                // The tested prime IS the candidate's value
                if self.registry.report_prime(p, key) {
                    println!("  {} is prime!", term);
                    found += 1;
                }
            } else if self.registry.report_factor(p, key) {
                println!("  {} | {}", p, term);
                if let Err(e) = self.factors.log(p, &term) {
                    eprintln!("Warning: could not append to factor file: {}", e);
                }
                found += 1;
            }
        }

        self.hits = hits;
        self.hits.clear();
        found
    }
}

impl SieveTest for KbnTest {
    fn test_mega_prime_chunk(&mut self, primes: &[u64]) -> ChunkOutcome {
        self.hits.clear();

        // Four-wide scalar walk, single-lane tail
        let mut quads = primes.chunks_exact(4);
        for quad in quads.by_ref() {
            self.scan_batch(quad);
        }
        let tail = quads.remainder().to_vec();
        for p in tail {
            self.scan_one(p);
        }

        ChunkOutcome {
            primes_tested: primes.len() as u64,
            factors_found: self.report_hits(),
        }
    }

    fn test_mini_prime_chunk(&mut self, primes: &[u64]) -> ChunkOutcome {
        if self.family.vector_below == 0 {
            eprintln!("Error: mini-chunk dispatched but vector path is disabled");
            std::process::exit(1);
        }

        self.hits.clear();
        self.scan_batch(primes);

        ChunkOutcome {
            primes_tested: primes.len() as u64,
            factors_found: self.report_hits(),
        }
    }

    fn mini_chunk_range(&self) -> Option<MiniChunkRange> {
        (self.family.vector_below > 0).then_some(MiniChunkRange {
            lo: 0,
            hi: self.family.vector_below,
            group: 4,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(k: u64, b: u64, c: i64, n_min: u64, n_max: u64) -> KbnFamily {
        KbnFamily::new(k, b, c, n_min, n_max, 0)
    }

    fn test_rig(fam: KbnFamily) -> (KbnTest, Arc<dyn TermRegistry>) {
        let registry = fam.create_registry(None);
        let test = KbnTest {
            family: fam,
            registry: Arc::clone(&registry),
            factors: Arc::new(FactorLog::disabled()),
            hits: Vec::new(),
        };
        (test, registry)
    }

    /// Direct divisibility check via wide arithmetic.
    fn divides(p: u64, k: u64, b: u64, c: i64, n: u64) -> bool {
        let mut pw: u64 = 1 % p;
        for _ in 0..n {
            pw = mul_mod(pw, b % p, p);
        }
        let cm = (c as i128).rem_euclid(p as i128) as u64;
        add_mod(mul_mod(k % p, pw, p), cm, p) == 0
    }

    #[test]
    fn test_term_text_round_trip() {
        let fam = family(5, 2, 1, 10, 100);
        assert_eq!(fam.form(), "5*2^n+1");
        assert_eq!(fam.candidate_term(0), "5*2^10+1");
        assert_eq!(fam.candidate_term(32), "5*2^42+1");
        assert_eq!(fam.parse_candidate("5*2^42+1"), Some(32));
        assert_eq!(fam.parse_candidate("5*2^9+1"), None); // below nmin
        assert_eq!(fam.parse_candidate("5*2^42-1"), None); // wrong c
        assert_eq!(fam.parse_candidate("3*2^42+1"), None); // wrong k
        assert_eq!(fam.parse_candidate("garbage"), None);
    }

    #[test]
    fn test_term_text_negative_c() {
        let fam = family(3, 10, -7, 2, 50);
        assert_eq!(fam.form(), "3*10^n-7");
        assert_eq!(fam.candidate_term(0), "3*10^2-7");
        assert_eq!(fam.parse_candidate("3*10^2-7"), Some(0));
        assert_eq!(fam.parse_candidate("3*10^2+7"), None);
    }

    #[test]
    fn test_scan_one_matches_direct_divisibility() {
        let fam = family(5, 2, 1, 1, 40);
        let (mut test, _registry) = test_rig(fam);

        for p in [3_u64, 7, 11, 13, 97, 1009] {
            test.hits.clear();
            test.scan_one(p);
            let expected: Vec<(u64, u64)> = (1..=40)
                .filter(|&n| divides(p, 5, 2, 1, n))
                .map(|n| (p, n))
                .collect();
            assert_eq!(test.hits, expected, "p={}", p);
        }
    }

    #[test]
    fn test_mini_and_mega_paths_agree() {
        let fam = KbnFamily::new(7, 3, -4, 1, 60, 10_000);
        let primes = [5_u64, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43];

        // Mega path: quads plus tail
        let (mut mega, _r1) = test_rig(fam);
        let mut quads = primes.chunks_exact(4);
        for quad in quads.by_ref() {
            mega.scan_batch(quad);
        }
        for &p in quads.remainder() {
            mega.scan_one(p);
        }
        let mut mega_hits = mega.hits.clone();
        mega_hits.sort();

        // Mini path: groups of 4 through the batched kernel
        let (mut mini, _r2) = test_rig(fam);
        for group in primes.chunks(4) {
            mini.scan_batch(group);
        }
        let mut mini_hits = mini.hits.clone();
        mini_hits.sort();

        assert_eq!(mega_hits, mini_hits);
    }

    #[test]
    fn test_mega_chunk_eliminates_expected_candidates() {
        let fam = family(5, 2, 1, 1, 30);
        let (mut test, registry) = test_rig(fam);

        let primes: Vec<u64> = vec![3, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43];
        let outcome = test.test_mega_prime_chunk(&primes);
        assert_eq!(outcome.primes_tested, primes.len() as u64);

        let snap = registry.snapshot();
        for key in 0..fam.candidate_count() {
            let n = 1 + key;
            // Both report paths clear the bit, so a candidate whose own
            // value is a tested prime counts as eliminated too
            let eliminated = primes.iter().any(|&p| divides(p, 5, 2, 1, n));
            assert_eq!(
                !snap.keys.contains(&key),
                eliminated,
                "candidate n={} (5*2^{}+1)",
                n,
                n
            );
        }
        assert_eq!(outcome.factors_found, 30 - snap.live as u64);
    }

    #[test]
    fn test_prime_valued_candidate_uses_report_prime() {
        // 1*2^n+1: n=1 gives 3, n=2 gives 5, n=4 gives 17 - all prime values
        let fam = family(1, 2, 1, 1, 4);
        let (mut test, registry) = test_rig(fam);

        test.test_mega_prime_chunk(&[3, 5, 17]);

        let snap = registry.snapshot();
        // 3 | 9 (n=3) as a plain factor; 3, 5, 17 certified prime directly
        assert!(snap.keys.is_empty());
        assert_eq!(snap.live, 0);
    }

    #[test]
    fn test_repeated_chunk_reports_nothing_new() {
        let fam = family(5, 2, 1, 1, 30);
        let (mut test, registry) = test_rig(fam);

        let primes: Vec<u64> = vec![3, 7, 13];
        let first = test.test_mega_prime_chunk(&primes);
        assert!(first.factors_found > 0);
        let live_after = registry.live_count();

        // Same primes again: every hit loses the dedup race with the past
        let second = test.test_mega_prime_chunk(&primes);
        assert_eq!(second.factors_found, 0);
        assert_eq!(registry.live_count(), live_after);
    }

    #[test]
    fn test_mini_range_declaration_follows_option() {
        let fam_off = family(5, 2, 1, 1, 10);
        let (test_off, _r) = test_rig(fam_off);
        assert!(test_off.mini_chunk_range().is_none());

        let fam_on = KbnFamily::new(5, 2, 1, 1, 10, 5000);
        let (test_on, _r) = test_rig(fam_on);
        let range = test_on.mini_chunk_range().unwrap();
        assert_eq!(range.hi, 5000);
        assert_eq!(range.group, 4);
    }

    #[test]
    fn test_exact_value_u128_overflow_is_none() {
        let fam = family(5, 2, 1, 1, 200);
        assert_eq!(fam.exact_value_u128(3), Some(41));
        assert_eq!(fam.exact_value_u128(150), None);
    }
}
