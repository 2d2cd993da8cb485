//! Bloom filter over topic identities.
//!
//! Each cache block carries one of these so a drain scanning for a
//! single topic can skip whole blocks. Uses the standard double-hashing
//! construction: two independent 64-bit hashes combined as
//! `h1 + i * h2` for each probe.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_probes: u32,
}

impl BloomFilter {
    /// Creates a filter sized for `expected_items` at `bits_per_item`
    /// density. Probe count is tuned to the density (`0.69 * bits`),
    /// clamped to a sane range.
    pub fn new(expected_items: usize, bits_per_item: u32) -> Self {
        let num_bits = (expected_items as u64 * bits_per_item as u64).max(64);
        let num_probes = ((bits_per_item as f64 * 0.69) as u32).clamp(1, 30);
        Self {
            bits: vec![0; num_bits.div_ceil(64) as usize],
            num_bits,
            num_probes,
        }
    }

    fn hash_pair(item: &impl Hash) -> (u64, u64) {
        let mut first = DefaultHasher::new();
        item.hash(&mut first);
        let h1 = first.finish();

        let mut second = DefaultHasher::new();
        h1.hash(&mut second);
        item.hash(&mut second);
        (h1, second.finish())
    }

    pub fn insert(&mut self, item: &impl Hash) {
        let (h1, h2) = Self::hash_pair(item);
        for i in 0..self.num_probes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            self.bits[(bit / 64) as usize] |= 1 << (bit % 64);
        }
    }

    /// May return a false positive, never a false negative.
    pub fn may_contain(&self, item: &impl Hash) -> bool {
        let (h1, h2) = Self::hash_pair(item);
        for i in 0..self.num_probes as u64 {
            let bit = h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits;
            if self.bits[(bit / 64) as usize] & (1 << (bit % 64)) == 0 {
                return false;
            }
        }
        true
    }

    /// Memory occupied by the bit array.
    pub fn byte_size(&self) -> usize {
        self.bits.len() * 8
    }
}
