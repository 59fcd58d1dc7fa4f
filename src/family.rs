use std::sync::Arc;

use crate::checkpoint::FactorLog;
use crate::cullen_woodall::CullenWoodallFamily;
use crate::kbn::KbnFamily;
use crate::registry::TermRegistry;
use crate::worker::SieveTest;

/// A sequence family owns everything specific to one closed form: the
/// candidate key mapping, the term text format, and the numeric test
/// routine. The engine only ever talks to this trait.
pub trait SequenceFamily: Send + Sync {
    fn name(&self) -> &'static str;

    /// Closed form with `n` symbolic, e.g. "5*2^n+1"; checkpoint header text.
    fn form(&self) -> String;

    /// Size of the dense candidate key space.
    fn candidate_count(&self) -> u64;

    /// Append the term text for a candidate key (checkpoint line format).
    fn push_candidate(&self, key: u64, out: &mut String);

    fn candidate_term(&self, key: u64) -> String {
        let mut s = String::new();
        self.push_candidate(key, &mut s);
        s
    }

    /// Inverse of `push_candidate`; None for text that is not a candidate of
    /// this family (wrong form, out-of-range n).
    fn parse_candidate(&self, term: &str) -> Option<u64>;

    /// Fresh all-alive registry, or one replayed from checkpoint survivors.
    fn create_registry(&self, survivors: Option<&[u64]>) -> Arc<dyn TermRegistry>;

    fn create_test(
        &self,
        registry: Arc<dyn TermRegistry>,
        factors: Arc<FactorLog>,
    ) -> Box<dyn SieveTest>;

    /// Capability probe for an accelerator backend. A family that can drive
    /// a device returns one extra test routine plus the device's batching
    /// geometry; the built-in families have none.
    fn device_probe(
        &self,
        _registry: Arc<dyn TermRegistry>,
        _factors: Arc<FactorLog>,
    ) -> Option<DeviceProbe> {
        None
    }
}

/// Result of a successful device enumeration: the device-driven test routine
/// and its preferred batching. The device chunk size is work_group_size x
/// work_groups, known only once the device has been probed.
pub struct DeviceProbe {
    pub test: Box<dyn SieveTest>,
    pub work_group_size: usize,
    pub work_groups: usize,
}

impl DeviceProbe {
    pub fn chunk_size(&self) -> usize {
        self.work_group_size * self.work_groups
    }
}

/// Validated options for each built-in family, as gathered from the CLI.
pub enum FamilyOptions {
    Kbn {
        k: u64,
        b: u64,
        c: i64,
        n_min: u64,
        n_max: u64,
        vector_below: u64,
    },
    CullenWoodall {
        n_min: u64,
        n_max: u64,
        cullen: bool,
        woodall: bool,
    },
}

/// Factory: the one place a family name becomes a concrete implementation.
pub fn create(options: FamilyOptions) -> Arc<dyn SequenceFamily> {
    match options {
        FamilyOptions::Kbn {
            k,
            b,
            c,
            n_min,
            n_max,
            vector_below,
        } => Arc::new(KbnFamily::new(k, b, c, n_min, n_max, vector_below)),
        FamilyOptions::CullenWoodall {
            n_min,
            n_max,
            cullen,
            woodall,
        } => Arc::new(CullenWoodallFamily::new(n_min, n_max, cullen, woodall)),
    }
}

/// (a * b) mod p without overflow.
#[inline]
pub fn mul_mod(a: u64, b: u64, p: u64) -> u64 {
    ((a as u128 * b as u128) % p as u128) as u64
}

/// (a + b) mod p without overflow.
#[inline]
pub fn add_mod(a: u64, b: u64, p: u64) -> u64 {
    ((a as u128 + b as u128) % p as u128) as u64
}

/// base^exp mod p by square-and-multiply.
pub fn pow_mod(mut base: u64, mut exp: u64, p: u64) -> u64 {
    if p == 1 {
        return 0;
    }
    let mut result = 1_u64;
    base %= p;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mul_mod(result, base, p);
        }
        base = mul_mod(base, base, p);
        exp >>= 1;
    }
    result
}
