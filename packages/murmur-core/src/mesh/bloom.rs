//! Bloom filter for duplicate packet suppression.
//!
//! Sized from an expected element count and a target false-positive rate
//! using the standard formulas `m = -n·ln(p)/ln(2)²` and `k = (m/n)·ln(2)`.
//! Membership can only produce false positives, never false negatives:
//! a dropped duplicate is occasionally wrong, a relayed duplicate never is
//! beyond the configured rate.
//!
//! Filters are serializable and can be merged (bitwise OR) for peer
//! exchange.

use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Probabilistic set over byte strings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BloomFilter {
    #[serde(with = "bits_serde")]
    bits: BitVec<u8, Lsb0>,
    /// Number of hash functions (k)
    hashes: usize,
    /// Size in bits (m)
    size: usize,
    /// Elements inserted (n)
    count: usize,
}

mod bits_serde {
    use bitvec::prelude::*;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bits: &BitVec<u8, Lsb0>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let bytes: Vec<u8> = bits.as_raw_slice().to_vec();
        (bytes, bits.len()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BitVec<u8, Lsb0>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (bytes, len): (Vec<u8>, usize) = Deserialize::deserialize(deserializer)?;
        let mut bits = BitVec::<u8, Lsb0>::from_vec(bytes);
        bits.truncate(len);
        Ok(bits)
    }
}

impl BloomFilter {
    /// Create a filter with explicit size and hash count.
    pub fn new(size_bits: usize, hashes: usize) -> Self {
        Self {
            bits: bitvec![u8, Lsb0; 0; size_bits.max(8)],
            hashes: hashes.max(1),
            size: size_bits.max(8),
            count: 0,
        }
    }

    /// Create a filter sized for `expected` elements at `target_fpr`.
    pub fn with_capacity(expected: usize, target_fpr: f64) -> Self {
        let n = expected.max(1) as f64;
        let p = target_fpr.clamp(1e-9, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = (-(n * p.ln()) / (ln2 * ln2)).ceil() as usize;
        let k = ((m as f64 / n) * ln2).round().max(1.0) as usize;
        Self::new(m, k)
    }

    /// Bit positions for an element: SHA-256 double hashing
    /// `g_i(x) = h1(x) + i·h2(x) mod m`.
    fn positions(&self, element: &[u8]) -> Vec<usize> {
        let digest = Sha256::digest(element);
        let h1 = u64::from_le_bytes(digest[..8].try_into().expect("8 bytes"));
        let h2 = u64::from_le_bytes(digest[8..16].try_into().expect("8 bytes")) | 1;
        (0..self.hashes)
            .map(|i| {
                let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
                (combined % self.size as u64) as usize
            })
            .collect()
    }

    /// Insert an element. Afterwards `contains` is guaranteed true for it.
    pub fn insert(&mut self, element: &[u8]) {
        for position in self.positions(element) {
            self.bits.set(position, true);
        }
        self.count += 1;
    }

    /// Test membership: `false` means definitely absent.
    pub fn contains(&self, element: &[u8]) -> bool {
        self.positions(element).iter().all(|&p| self.bits[p])
    }

    /// Insert and report whether the element was (probably) already present.
    pub fn check_and_insert(&mut self, element: &[u8]) -> bool {
        let present = self.contains(element);
        if !present {
            self.insert(element);
        }
        present
    }

    /// Merge another filter of identical parameters (bitwise OR).
    pub fn merge(&mut self, other: &BloomFilter) -> bool {
        if self.size != other.size || self.hashes != other.hashes {
            return false;
        }
        let ours = self.bits.as_raw_mut_slice();
        let theirs = other.bits.as_raw_slice();
        for (a, b) in ours.iter_mut().zip(theirs.iter()) {
            *a |= *b;
        }
        self.count += other.count;
        true
    }

    /// Reset to empty.
    pub fn clear(&mut self) {
        self.bits.fill(false);
        self.count = 0;
    }

    /// Elements inserted so far.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether nothing has been inserted.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Estimated false-positive rate at the current load:
    /// `(1 - e^(-kn/m))^k`.
    pub fn estimated_fpr(&self) -> f64 {
        let k = self.hashes as f64;
        let n = self.count as f64;
        let m = self.size as f64;
        (1.0 - (-k * n / m).exp()).powf(k)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_false_negatives() {
        let mut filter = BloomFilter::with_capacity(1000, 0.01);
        for i in 0..1000u32 {
            filter.insert(&i.to_be_bytes());
        }
        for i in 0..1000u32 {
            assert!(filter.contains(&i.to_be_bytes()), "lost element {}", i);
        }
    }

    #[test]
    fn test_fpr_within_target_at_nominal_load() {
        let mut filter = BloomFilter::with_capacity(10_000, 0.01);
        for i in 0..10_000u32 {
            filter.insert(&i.to_be_bytes());
        }
        assert!(
            filter.estimated_fpr() <= 0.015,
            "estimated FPR {} too high",
            filter.estimated_fpr()
        );

        // Empirical check on elements never inserted
        let mut false_positives = 0usize;
        for i in 10_000..20_000u32 {
            if filter.contains(&i.to_be_bytes()) {
                false_positives += 1;
            }
        }
        assert!(
            false_positives < 300,
            "{} false positives out of 10000",
            false_positives
        );
    }

    #[test]
    fn test_check_and_insert() {
        let mut filter = BloomFilter::with_capacity(100, 0.01);
        assert!(!filter.check_and_insert(b"packet-1"));
        assert!(filter.check_and_insert(b"packet-1"));
        assert_eq!(filter.len(), 1);
    }

    #[test]
    fn test_merge() {
        let mut a = BloomFilter::with_capacity(100, 0.01);
        let mut b = BloomFilter::with_capacity(100, 0.01);
        a.insert(b"from-a");
        b.insert(b"from-b");

        assert!(a.merge(&b));
        assert!(a.contains(b"from-a"));
        assert!(a.contains(b"from-b"));

        // Mismatched parameters refuse to merge
        let c = BloomFilter::new(64, 2);
        assert!(!a.merge(&c));
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut filter = BloomFilter::with_capacity(500, 0.01);
        for i in 0..100u32 {
            filter.insert(&i.to_be_bytes());
        }
        let bytes = bincode::serialize(&filter).unwrap();
        let restored: BloomFilter = bincode::deserialize(&bytes).unwrap();
        for i in 0..100u32 {
            assert!(restored.contains(&i.to_be_bytes()));
        }
        assert_eq!(restored.len(), filter.len());
    }

    #[test]
    fn test_clear() {
        let mut filter = BloomFilter::with_capacity(100, 0.01);
        filter.insert(b"x");
        filter.clear();
        assert!(filter.is_empty());
        assert!(!filter.contains(b"x"));
    }
}
