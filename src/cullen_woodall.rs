// Cullen/Woodall sequence family: n*2^n+1 and n*2^n-1.
//
// For a prime p, n*2^n mod p is walked incrementally across the range; a
// residue of p-1 flags the Cullen candidate and a residue of 1 flags the
// Woodall candidate, so one walk serves both streams.

use rug::Integer;
use std::sync::Arc;

use crate::checkpoint::FactorLog;
use crate::family::{SequenceFamily, mul_mod, pow_mod};
use crate::registry::{BitmapRegistry, TermRegistry};
use crate::worker::{ChunkOutcome, SieveTest};

#[derive(Clone, Copy)]
pub struct CullenWoodallFamily {
    n_min: u64,
    n_max: u64,
    cullen: bool,
    woodall: bool,
}

impl CullenWoodallFamily {
    pub fn new(n_min: u64, n_max: u64, cullen: bool, woodall: bool) -> Self {
        // Neither flag selects a stream: sieve both
        let (cullen, woodall) = if !cullen && !woodall {
            (true, true)
        } else {
            (cullen, woodall)
        };

        if n_min < 1 || n_max < n_min || n_max > u32::MAX as u64 {
            eprintln!("Error: need 1 <= nmin <= nmax <= {}", u32::MAX);
            std::process::exit(1);
        }
        // 1*2^1-1 = 1 has no factors to find
        if woodall && n_min < 2 {
            eprintln!("Error: nmin must be at least 2 when sieving Woodall numbers");
            std::process::exit(1);
        }

        CullenWoodallFamily {
            n_min,
            n_max,
            cullen,
            woodall,
        }
    }

    fn both(&self) -> bool {
        self.cullen && self.woodall
    }

    /// Candidate key -> (n, is_woodall). With both streams enabled the keys
    /// interleave: even keys are Cullen, odd keys are Woodall.
    fn key_parts(&self, key: u64) -> (u64, bool) {
        if self.both() {
            (self.n_min + key / 2, key % 2 == 1)
        } else {
            (self.n_min + key, self.woodall)
        }
    }

    fn key_for(&self, n: u64, is_woodall: bool) -> u64 {
        if self.both() {
            2 * (n - self.n_min) + is_woodall as u64
        } else {
            n - self.n_min
        }
    }

    fn exact_integer(&self, n: u64, is_woodall: bool) -> Integer {
        let mut value = Integer::from(Integer::u_pow_u(2, n as u32));
        value *= n;
        if is_woodall {
            value -= 1_i64;
        } else {
            value += 1_i64;
        }
        value
    }

    fn exact_value_u128(&self, n: u64, is_woodall: bool) -> Option<u128> {
        if n >= 128 {
            return None;
        }
        let value = (1_u128 << n).checked_mul(n as u128)?;
        if is_woodall {
            value.checked_sub(1)
        } else {
            value.checked_add(1)
        }
    }
}

impl SequenceFamily for CullenWoodallFamily {
    fn name(&self) -> &'static str {
        "cullen-woodall"
    }

    fn form(&self) -> String {
        if self.both() {
            "n*2^n+/-1".to_string()
        } else if self.cullen {
            "n*2^n+1".to_string()
        } else {
            "n*2^n-1".to_string()
        }
    }

    fn candidate_count(&self) -> u64 {
        let span = self.n_max - self.n_min + 1;
        if self.both() { 2 * span } else { span }
    }

    fn push_candidate(&self, key: u64, out: &mut String) {
        let (n, is_woodall) = self.key_parts(key);
        let mut itoa_buf = itoa::Buffer::new();
        out.push_str(itoa_buf.format(n));
        out.push_str("*2^");
        out.push_str(itoa_buf.format(n));
        out.push_str(if is_woodall { "-1" } else { "+1" });
    }

    fn parse_candidate(&self, term: &str) -> Option<u64> {
        let (n_text, rest) = term.split_once("*2^")?;
        let n: u64 = n_text.parse().ok()?;

        let is_woodall = match rest.strip_prefix(n_text) {
            Some("+1") => false,
            Some("-1") => true,
            _ => return None,
        };
        if is_woodall && !self.woodall {
            return None;
        }
        if !is_woodall && !self.cullen {
            return None;
        }
        if n < self.n_min || n > self.n_max {
            return None;
        }
        Some(self.key_for(n, is_woodall))
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
        Box::new(CullenWoodallTest {
            family: *self,
            registry,
            factors,
            hits: Vec::new(),
        })
    }
}

struct CullenWoodallTest {
    family: CullenWoodallFamily,
    registry: Arc<dyn TermRegistry>,
    factors: Arc<FactorLog>,
    hits: Vec<(u64, u64, bool)>, // (prime, n, is_woodall)
}

impl CullenWoodallTest {
    fn scan_one(&mut self, p: u64) {
        let fam = &self.family;
        let mut pow = pow_mod(2, fam.n_min, p);

        for n in fam.n_min..=fam.n_max {
            let r = mul_mod(n % p, pow, p);
            if fam.cullen && r == p - 1 {
                self.hits.push((p, n, false));
            }
            if fam.woodall && r == 1 {
                self.hits.push((p, n, true));
            }
            pow = mul_mod(pow, 2, p);
        }
    }

    fn report_hits(&mut self) -> u64 {
        let hits = std::mem::take(&mut self.hits);
        let mut found = 0_u64;

        for &(p, n, is_woodall) in &hits {
            let key = self.family.key_for(n, is_woodall);
            let term = self.family.candidate_term(key);

            if !self
                .family
                .exact_integer(n, is_woodall)
                .is_divisible(&Integer::from(p))
            {
                eprintln!("Error: verification failed: {} does not divide {}", p, term);
                std::process::exit(1);
            }

            if self.family.exact_value_u128(n, is_woodall) == Some(p as u128) {
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

impl SieveTest for CullenWoodallTest {
    fn test_mega_prime_chunk(&mut self, primes: &[u64]) -> ChunkOutcome {
        self.hits.clear();
        for &p in primes {
            self.scan_one(p);
        }
        ChunkOutcome {
            primes_tested: primes.len() as u64,
            factors_found: self.report_hits(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_rig(fam: CullenWoodallFamily) -> (CullenWoodallTest, Arc<dyn TermRegistry>) {
        let registry = fam.create_registry(None);
        let test = CullenWoodallTest {
            family: fam,
            registry: Arc::clone(&registry),
            factors: Arc::new(FactorLog::disabled()),
            hits: Vec::new(),
        };
        (test, registry)
    }

    fn divides(p: u64, n: u64, is_woodall: bool) -> bool {
        let mut pow: u64 = 1 % p;
        for _ in 0..n {
            pow = mul_mod(pow, 2 % p, p);
        }
        let r = mul_mod(n % p, pow, p);
        if is_woodall { r == 1 % p } else { (r + 1) % p == 0 }
    }

    #[test]
    fn test_term_text_and_key_mapping_both_streams() {
        let fam = CullenWoodallFamily::new(2, 100, true, true);
        assert_eq!(fam.form(), "n*2^n+/-1");
        assert_eq!(fam.candidate_count(), 198);
        assert_eq!(fam.candidate_term(0), "2*2^2+1");
        assert_eq!(fam.candidate_term(1), "2*2^2-1");
        assert_eq!(fam.candidate_term(6), "5*2^5+1");
        assert_eq!(fam.parse_candidate("5*2^5+1"), Some(6));
        assert_eq!(fam.parse_candidate("5*2^5-1"), Some(7));
        assert_eq!(fam.parse_candidate("5*2^6+1"), None); // mismatched n
        assert_eq!(fam.parse_candidate("101*2^101+1"), None); // above nmax
    }

    #[test]
    fn test_single_stream_keys_are_dense() {
        let fam = CullenWoodallFamily::new(2, 50, true, false);
        assert_eq!(fam.form(), "n*2^n+1");
        assert_eq!(fam.candidate_count(), 49);
        assert_eq!(fam.candidate_term(3), "5*2^5+1");
        assert_eq!(fam.parse_candidate("5*2^5+1"), Some(3));
        // Woodall text is not a candidate of a Cullen-only run
        assert_eq!(fam.parse_candidate("5*2^5-1"), None);
    }

    #[test]
    fn test_neither_flag_enables_both() {
        let fam = CullenWoodallFamily::new(2, 10, false, false);
        assert_eq!(fam.form(), "n*2^n+/-1");
        assert_eq!(fam.candidate_count(), 18);
    }

    #[test]
    fn test_scan_matches_direct_divisibility() {
        let fam = CullenWoodallFamily::new(2, 60, true, true);
        let (mut test, _registry) = test_rig(fam);

        for p in [3_u64, 5, 7, 11, 13, 97, 1009] {
            test.hits.clear();
            test.scan_one(p);
            let mut expected = Vec::new();
            for n in 2..=60 {
                if divides(p, n, false) {
                    expected.push((p, n, false));
                }
                if divides(p, n, true) {
                    expected.push((p, n, true));
                }
            }
            assert_eq!(test.hits, expected, "p={}", p);
        }
    }

    #[test]
    fn test_known_small_factors() {
        // 3 | 2*2^2+1 = 9 and 7 | 4*2^4-1 = 63
        let fam = CullenWoodallFamily::new(2, 10, true, true);
        let (mut test, registry) = test_rig(fam);

        test.test_mega_prime_chunk(&[3, 7]);

        let snap = registry.snapshot();
        assert!(!snap.keys.contains(&fam.key_for(2, false))); // 3 | 9
        assert!(!snap.keys.contains(&fam.key_for(4, true))); // 7 | 63
        // W(3) = 23 survives both
        assert!(snap.keys.contains(&fam.key_for(3, true)));
    }

    #[test]
    fn test_prime_valued_candidate_uses_report_prime() {
        // W(2) = 7 and W(3) = 23 are prime values
        let fam = CullenWoodallFamily::new(2, 3, false, true);
        let (mut test, registry) = test_rig(fam);

        let outcome = test.test_mega_prime_chunk(&[7, 23]);
        assert_eq!(outcome.factors_found, 2);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_mega_chunk_counts_only_new_eliminations() {
        let fam = CullenWoodallFamily::new(2, 40, true, true);
        let (mut test, registry) = test_rig(fam);

        let first = test.test_mega_prime_chunk(&[3, 5, 7, 11]);
        assert!(first.factors_found > 0);
        let live_after = registry.live_count();

        let second = test.test_mega_prime_chunk(&[3, 5, 7, 11]);
        assert_eq!(second.factors_found, 0);
        assert_eq!(registry.live_count(), live_after);
    }

    #[test]
    fn test_no_mini_range() {
        let fam = CullenWoodallFamily::new(2, 10, true, true);
        let (test, _registry) = test_rig(fam);
        assert!(test.mini_chunk_range().is_none());
    }
}
