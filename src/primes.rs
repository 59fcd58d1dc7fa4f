// Ascending prime stream for the sieve controller.
//
// Odd-only, bit-packed, segmented Sieve of Eratosthenes: small primes up to
// sqrt(max) come from a base sieve, everything above is generated one
// 32KB segment at a time (fits in L1 cache) and handed out on demand.

/// Segment size constants for the segmented generation phase.
pub const SEGMENT_SIZE_BITS: usize = 32 * 1024 * 8; // 32KB in bits = 262,144 odd numbers
pub const SEGMENT_SIZE_NUMBERS: u64 = (SEGMENT_SIZE_BITS as u64) * 2;

/// One unit of work for a worker: an ordered, contiguous batch of primes.
///
/// `mini` marks a fixed-size group destined for a vectorized test path;
/// everything else is a bulk "mega" batch.
#[derive(Clone)]
pub struct PrimeSlice {
    pub primes: Vec<u64>,
    pub mini: bool,
}

impl PrimeSlice {
    pub fn first(&self) -> u64 {
        self.primes.first().copied().unwrap_or(0)
    }

    pub fn last(&self) -> u64 {
        self.primes.last().copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.primes.len()
    }
}

/// Generates every prime p with min < p <= max, in ascending order.
///
/// The exclusive lower bound is what makes resuming exact: a checkpoint
/// watermark w restarts the stream at the first prime above w, so no prime
/// is ever re-tested and none is skipped.
pub struct PrimeStream {
    min: u64,
    max: u64,
    small_primes: Vec<u64>,
    buf: Vec<u64>,
    pos: usize,
    low: u64, // next segment start (odd), 0 once exhausted
    segment: Vec<u64>,
}

impl PrimeStream {
    pub fn new(min: u64, max: u64) -> Self {
        let sqrt_limit = isqrt(max);
        let small_primes = base_sieve(sqrt_limit);

        // First batch: small primes inside (min, max]
        let buf: Vec<u64> = small_primes
            .iter()
            .copied()
            .filter(|&p| p > min && p <= max)
            .collect();

        // Segments start at the first odd number after the base-sieve range,
        // or after min when resuming past it
        let mut low = (sqrt_limit + 1) | 1;
        if min >= low {
            low = (min + 1) | 1;
        }
        if low > max {
            low = 0; // Nothing above the base sieve
        }

        let segment_words = SEGMENT_SIZE_BITS.div_ceil(64);

        PrimeStream {
            min,
            max,
            small_primes,
            buf,
            pos: 0,
            low,
            segment: vec![0_u64; segment_words],
        }
    }

    /// Next prime that would be dispatched, without consuming it.
    pub fn peek(&mut self) -> Option<u64> {
        while self.pos >= self.buf.len() {
            if !self.refill() {
                return None;
            }
        }
        Some(self.buf[self.pos])
    }

    /// Take up to `len` primes as one slice. Returns None when exhausted.
    pub fn next_slice(&mut self, len: usize, mini: bool) -> Option<PrimeSlice> {
        self.peek()?;
        let mut primes = Vec::with_capacity(len);
        while primes.len() < len {
            match self.peek() {
                Some(p) => {
                    primes.push(p);
                    self.pos += 1;
                }
                None => break,
            }
        }
        Some(PrimeSlice { primes, mini })
    }

    /// Sieve the next segment into the buffer. Returns false when the
    /// configured range is exhausted.
    fn refill(&mut self) -> bool {
        if self.low == 0 || self.low > self.max {
            self.low = 0;
            return false;
        }

        let low = self.low;
        let high = low + SEGMENT_SIZE_NUMBERS - 1;

        // Reinitialize entire segment (all bits to 1 = prime)
        self.segment.fill(!0_u64);

        // For each small odd prime, mark its multiples in this segment
        for &p in self.small_primes.iter().skip(1) {
            // First odd multiple of p in [low, high]
            let mut start = low.div_ceil(p) * p;
            if start % 2 == 0 {
                start += p;
            }

            while start <= high {
                let idx = ((start - low) / 2) as usize;
                clear_bit(&mut self.segment, idx);
                start += p * 2;
            }
        }

        // Collect surviving numbers inside (min, max]
        self.buf.clear();
        self.pos = 0;
        for word_idx in 0..self.segment.len() {
            let mut word = self.segment[word_idx];

            while word != 0 {
                let bit_idx = word.trailing_zeros() as usize;
                let idx = (word_idx * 64 + bit_idx) as u64;

                let num = low + idx * 2;
                if num > self.min && num <= self.max {
                    self.buf.push(num);
                }

                word &= word - 1; // Clear lowest set bit
            }
        }

        // high is even (low odd + even span - 1), so the next odd is high + 1
        self.low = if high >= self.max { 0 } else { high + 1 };
        !self.buf.is_empty() || self.low != 0
    }
}

/// Odd-only base sieve up to `limit` inclusive.
fn base_sieve(limit: u64) -> Vec<u64> {
    if limit < 2 {
        return vec![];
    }
    if limit == 2 {
        return vec![2];
    }

    let mut primes = vec![2_u64];

    // Array size is half since we only track odd numbers:
    // index i represents the number (2*i + 3)
    let size = ((limit - 1) / 2) as usize;
    let mut is_prime = vec![true; size];

    let sqrt_index = (isqrt(limit).saturating_sub(1) / 2) as usize;

    for i in 0..=sqrt_index.min(size.saturating_sub(1)) {
        if is_prime[i] {
            let p = 2 * i + 3;
            let mut j = (p * p - 3) / 2;
            while j < size {
                is_prime[j] = false;
                j += p;
            }
        }
    }

    for (i, &is_p) in is_prime.iter().enumerate() {
        if is_p {
            primes.push((2 * i + 3) as u64);
        }
    }

    primes
}

#[inline]
fn clear_bit(bits: &mut [u64], idx: usize) {
    let word_idx = idx / 64;
    let bit_idx = idx % 64;
    bits[word_idx] &= !(1_u64 << bit_idx);
}

/// Integer square root with f64 seed and exact fix-up.
fn isqrt(n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let mut r = (n as f64).sqrt() as u64;
    while r.checked_mul(r).map(|sq| sq > n).unwrap_or(true) {
        r -= 1;
    }
    while (r + 1).checked_mul(r + 1).map(|sq| sq <= n).unwrap_or(false) {
        r += 1;
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_primes(min: u64, max: u64) -> Vec<u64> {
        let mut out = Vec::new();
        'outer: for n in (min + 1)..=max {
            if n < 2 {
                continue;
            }
            let mut d = 2;
            while d * d <= n {
                if n % d == 0 {
                    continue 'outer;
                }
                d += 1;
            }
            out.push(n);
        }
        out
    }

    fn drain(stream: &mut PrimeStream, len: usize) -> Vec<u64> {
        let mut all = Vec::new();
        while let Some(slice) = stream.next_slice(len, false) {
            all.extend_from_slice(&slice.primes);
        }
        all
    }

    #[test]
    fn test_small_range_matches_reference() {
        let mut s = PrimeStream::new(1, 100);
        assert_eq!(drain(&mut s, 7), reference_primes(1, 100));
    }

    #[test]
    fn test_stream_crosses_into_segments() {
        // 600,000 is past the first segment boundary, so both the base-sieve
        // batch and segmented generation are exercised
        let mut s = PrimeStream::new(1, 600_000);
        let primes = drain(&mut s, 4096);
        assert_eq!(primes.first().copied(), Some(2));
        assert_eq!(primes.last().copied(), Some(599_999));
        // spot checks
        assert!(primes.binary_search(&524_287).is_ok()); // 2^19 - 1
        assert!(primes.binary_search(&524_289).is_err());
    }

    #[test]
    fn test_slices_are_disjoint_ordered_and_complete() {
        let mut s = PrimeStream::new(1, 20_000);
        let mut all = Vec::new();
        loop {
            // Uneven slice sizes to shake out boundary bugs
            let len = 1 + (all.len() % 13);
            match s.next_slice(len, false) {
                Some(slice) => {
                    assert!(!slice.primes.is_empty());
                    all.extend_from_slice(&slice.primes);
                }
                None => break,
            }
        }
        let reference = reference_primes(1, 20_000);
        assert_eq!(all, reference);
        // strictly ascending implies no duplicates and no reordering
        for w in all.windows(2) {
            assert!(w[0] < w[1]);
        }
    }

    #[test]
    fn test_resume_is_exclusive_of_watermark() {
        let mut s = PrimeStream::new(97, 200);
        let primes = drain(&mut s, 8);
        assert_eq!(primes, reference_primes(97, 200));
        assert_eq!(primes.first().copied(), Some(101));
    }

    #[test]
    fn test_resume_above_sqrt_limit() {
        let mut full = PrimeStream::new(1, 550_000);
        let all = drain(&mut full, 1000);
        let expected: Vec<u64> = all.iter().copied().filter(|&p| p > 530_000).collect();

        let mut resumed = PrimeStream::new(530_000, 550_000);
        assert_eq!(drain(&mut resumed, 1000), expected);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut s = PrimeStream::new(1, 50);
        assert_eq!(s.peek(), Some(2));
        assert_eq!(s.peek(), Some(2));
        let slice = s.next_slice(3, false).unwrap();
        assert_eq!(slice.primes, vec![2, 3, 5]);
        assert_eq!(s.peek(), Some(7));
    }

    #[test]
    fn test_empty_range() {
        let mut s = PrimeStream::new(100, 100);
        assert!(s.peek().is_none());
        assert!(s.next_slice(10, false).is_none());
    }

    #[test]
    fn test_mini_slice_flag_and_size() {
        let mut s = PrimeStream::new(1, 1000);
        let slice = s.next_slice(4, true).unwrap();
        assert!(slice.mini);
        assert_eq!(slice.len(), 4);
        assert_eq!(slice.first(), 2);
        assert_eq!(slice.last(), 7);
    }

    #[test]
    fn test_isqrt_exact() {
        assert_eq!(isqrt(0), 0);
        assert_eq!(isqrt(1), 1);
        assert_eq!(isqrt(24), 4);
        assert_eq!(isqrt(25), 5);
        assert_eq!(isqrt(u64::MAX), (1_u64 << 32) - 1);
    }
}
