//! TANDEM - Bloom Filter
//! Per-SSTable membership filter consulted before any disk read.
//!
//! False positives are possible, false negatives are not. The filter is
//! rebuilt from the table's records on every open, like the sparse index,
//! so its hashing never has to be stable across builds.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Second seed for double hashing.
const SECOND_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Bit-array Bloom filter sized for an expected key count.
///
/// With `k` hash functions and `m` bits for `n` keys the false positive rate is
/// about `(1 - e^(-kn/m))^k`.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: usize,
    num_hashes: u32,
    count: usize,
}

impl BloomFilter {
    /// Size the filter for `expected_items` at `false_positive_rate`:
    /// `m = -n ln(p) / ln(2)^2` bits and `k = (m / n) ln(2)` hash functions.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let expected_items = expected_items.max(1);
        let fp_rate = false_positive_rate.clamp(0.0001, 0.5);

        let num_bits =
            (-(expected_items as f64) * fp_rate.ln() / 2.0_f64.ln().powi(2)).ceil() as usize;
        let num_bits = num_bits.max(64);
        let num_hashes = ((num_bits as f64 / expected_items as f64) * 2.0_f64.ln()).ceil() as u32;

        Self {
            bits: vec![0u8; num_bits.div_ceil(8)],
            num_bits,
            num_hashes: num_hashes.clamp(1, 16),
            count: 0,
        }
    }

    /// Hash pair used for double hashing. Computing it once per key lets
    /// callers gather hashes before the filter can be sized.
    pub fn hash_pair(key: &[u8]) -> (u64, u64) {
        (seeded_hash(key, 0), seeded_hash(key, SECOND_SEED) | 1)
    }

    pub fn insert(&mut self, key: &[u8]) {
        self.insert_hashed(Self::hash_pair(key));
    }

    pub fn insert_hashed(&mut self, (h1, h2): (u64, u64)) {
        for i in 0..self.num_hashes {
            let bit = self.bit_index(h1, h2, i);
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
        self.count += 1;
    }

    /// `false` means the key was never inserted.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let (h1, h2) = Self::hash_pair(key);
        (0..self.num_hashes).all(|i| {
            let bit = self.bit_index(h1, h2, i);
            self.bits[bit / 8] & (1 << (bit % 8)) != 0
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn num_bits(&self) -> usize {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn memory_usage(&self) -> usize {
        self.bits.len()
    }

    /// False positive rate implied by the current fill.
    pub fn estimated_fpr(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let k = self.num_hashes as f64;
        let m = self.num_bits as f64;
        let n = self.count as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }

    /// `h1 + i * h2 (mod m)`
    fn bit_index(&self, h1: u64, h2: u64, i: u32) -> usize {
        (h1.wrapping_add(u64::from(i).wrapping_mul(h2)) % self.num_bits as u64) as usize
    }
}

fn seeded_hash(key: &[u8], seed: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    key.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inserted_keys_always_found() {
        let mut bf = BloomFilter::new(1000, 0.01);
        for i in 0..1000 {
            bf.insert(format!("key_{}", i).as_bytes());
        }
        for i in 0..1000 {
            let key = format!("key_{}", i);
            assert!(bf.may_contain(key.as_bytes()), "false negative for {}", key);
        }
        assert_eq!(bf.count(), 1000);
    }

    #[test]
    fn test_false_positive_rate_near_target() {
        let mut bf = BloomFilter::new(1000, 0.01);
        for i in 0..1000 {
            bf.insert(format!("present_{}", i).as_bytes());
        }

        let false_positives = (0..10_000)
            .filter(|i| bf.may_contain(format!("absent_{}", i).as_bytes()))
            .count();
        // ~100 expected at 1%.
        assert!(false_positives < 300, "too many false positives: {}", false_positives);
        assert!(bf.estimated_fpr() < 0.05);
    }

    #[test]
    fn test_prehashed_insert_matches_insert() {
        let mut direct = BloomFilter::new(10, 0.01);
        let mut hashed = BloomFilter::new(10, 0.01);
        direct.insert(b"alpha");
        hashed.insert_hashed(BloomFilter::hash_pair(b"alpha"));

        assert!(hashed.may_contain(b"alpha"));
        assert_eq!(direct.bits, hashed.bits);
    }

    #[test]
    fn test_sizing() {
        let empty = BloomFilter::new(0, 0.01);
        assert!(empty.num_bits() >= 64);
        assert!(!empty.may_contain(b"anything"));
        assert_eq!(empty.estimated_fpr(), 0.0);

        let bf = BloomFilter::new(1000, 0.01);
        assert!(bf.num_bits() >= 9000);
        assert!(bf.num_hashes() >= 2);
        assert_eq!(bf.memory_usage(), bf.num_bits().div_ceil(8));
    }
}
