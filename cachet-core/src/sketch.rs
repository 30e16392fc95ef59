//! # Frequency Sketch
//!
//! Count-min sketch with four hash functions and periodic aging. The sketch
//! estimates how often a key has been seen recently; the TinyLFU admission
//! rule compares those estimates when the cache is full.
//!
//! Aging halves every counter once the number of recorded events passes the
//! sample threshold. Halving preserves the ratio between hot and cold keys
//! while letting stale popularity decay.
//!
//! The sketch is owned exclusively by the maintenance task, so it needs no
//! interior mutability.

/// Highest reportable frequency estimate.
const MAX_FREQUENCY: u8 = 15;

/// Events per counter before an aging pass runs.
const SAMPLE_FACTOR: u64 = 10;

/// Multipliers that derive the four row hashes from one key hash.
const SEEDS: [u64; 4] = [
    0xc3a5_c85c_97cb_3127,
    0xb492_b66f_be98_f273,
    0x9ae1_6a3b_2f90_404f,
    0xcbf2_9ce4_8422_2325,
];

/// Counter storage precision.
///
/// `Basic` packs sixteen 4-bit counters into each word. `Optimized` widens
/// every counter to a full byte, trading memory for less saturation error
/// between aging passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SketchMode {
    /// Packed 4-bit counters.
    Basic,
    /// One byte per counter.
    Optimized,
}

enum Counters {
    Nibbles(Box<[u64]>),
    Bytes(Box<[u8]>),
}

/// Popularity estimator consulted by the admission rule.
pub(crate) struct FrequencySketch {
    counters: Counters,
    counter_mask: u64,
    sample_size: u64,
    recorded: u64,
}

impl FrequencySketch {
    /// Sizes the sketch for a cache bounded at `maximum_size` entries.
    ///
    /// The counter count is `max(128, next_pow2(maximum_size * 10))`, so even
    /// tiny caches keep enough resolution to rank candidates.
    pub(crate) fn new(mode: SketchMode, maximum_size: u64) -> Self {
        let counters = maximum_size
            .saturating_mul(10)
            .max(128)
            .next_power_of_two();

        let storage = match mode {
            SketchMode::Basic => {
                let words = (counters / 16).max(8) as usize;
                Counters::Nibbles(vec![0u64; words].into_boxed_slice())
            }
            SketchMode::Optimized => Counters::Bytes(vec![0u8; counters as usize].into_boxed_slice()),
        };

        let counter_mask = match &storage {
            Counters::Nibbles(words) => (words.len() as u64 * 16) - 1,
            Counters::Bytes(bytes) => bytes.len() as u64 - 1,
        };

        FrequencySketch {
            counters: storage,
            counter_mask,
            sample_size: counters.saturating_mul(SAMPLE_FACTOR),
            recorded: 0,
        }
    }

    /// Records one observation of `hash`.
    pub(crate) fn record(&mut self, hash: u64) {
        let mut bumped = false;
        for seed in SEEDS {
            let index = Self::index(hash, seed, self.counter_mask);
            bumped |= self.increment(index);
        }
        if bumped {
            self.recorded += 1;
            if self.recorded >= self.sample_size {
                self.age();
            }
        }
    }

    /// Estimated frequency of `hash`, in `0..=15`.
    pub(crate) fn frequency(&self, hash: u64) -> u8 {
        let mut estimate = u8::MAX;
        for seed in SEEDS {
            let index = Self::index(hash, seed, self.counter_mask);
            estimate = estimate.min(self.counter(index));
        }
        estimate.min(MAX_FREQUENCY)
    }

    fn index(hash: u64, seed: u64, mask: u64) -> u64 {
        let mut mixed = hash.wrapping_mul(seed);
        mixed ^= mixed >> 32;
        mixed & mask
    }

    fn counter(&self, index: u64) -> u8 {
        match &self.counters {
            Counters::Nibbles(words) => {
                let word = words[(index / 16) as usize];
                let shift = (index % 16) * 4;
                ((word >> shift) & 0xf) as u8
            }
            Counters::Bytes(bytes) => bytes[index as usize],
        }
    }

    /// Increments the counter unless it is saturated; reports whether any
    /// change happened.
    fn increment(&mut self, index: u64) -> bool {
        match &mut self.counters {
            Counters::Nibbles(words) => {
                let slot = (index / 16) as usize;
                let shift = (index % 16) * 4;
                let current = (words[slot] >> shift) & 0xf;
                if current >= MAX_FREQUENCY as u64 {
                    return false;
                }
                words[slot] += 1u64 << shift;
                true
            }
            Counters::Bytes(bytes) => {
                let slot = index as usize;
                if bytes[slot] == u8::MAX {
                    return false;
                }
                bytes[slot] += 1;
                true
            }
        }
    }

    /// Halves every counter and the recorded-event total.
    fn age(&mut self) {
        match &mut self.counters {
            Counters::Nibbles(words) => {
                for word in words.iter_mut() {
                    // Halve all 16 nibbles at once: shift then clear the bit
                    // that leaked in from each neighbor.
                    *word = (*word >> 1) & 0x7777_7777_7777_7777;
                }
            }
            Counters::Bytes(bytes) => {
                for byte in bytes.iter_mut() {
                    *byte >>= 1;
                }
            }
        }
        self.recorded /= 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_hash_has_zero_frequency() {
        for mode in [SketchMode::Basic, SketchMode::Optimized] {
            let sketch = FrequencySketch::new(mode, 100);
            assert_eq!(sketch.frequency(0xdead_beef), 0);
        }
    }

    #[test]
    fn record_raises_frequency() {
        for mode in [SketchMode::Basic, SketchMode::Optimized] {
            let mut sketch = FrequencySketch::new(mode, 100);
            sketch.record(42);
            sketch.record(42);
            sketch.record(42);
            assert_eq!(sketch.frequency(42), 3);
        }
    }

    #[test]
    fn frequency_saturates_at_fifteen() {
        for mode in [SketchMode::Basic, SketchMode::Optimized] {
            let mut sketch = FrequencySketch::new(mode, 100);
            for _ in 0..100 {
                sketch.record(42);
            }
            assert_eq!(sketch.frequency(42), MAX_FREQUENCY);
        }
    }

    #[test]
    fn hot_keys_rank_above_cold_keys() {
        let mut sketch = FrequencySketch::new(SketchMode::Basic, 1000);
        for _ in 0..12 {
            sketch.record(7);
        }
        sketch.record(1001);
        assert!(sketch.frequency(7) > sketch.frequency(1001));
    }

    #[test]
    fn aging_halves_counters() {
        for mode in [SketchMode::Basic, SketchMode::Optimized] {
            let mut sketch = FrequencySketch::new(mode, 100);
            for _ in 0..10 {
                sketch.record(42);
            }
            assert_eq!(sketch.frequency(42), 10);

            sketch.age();
            assert_eq!(sketch.frequency(42), 5);
            assert_eq!(sketch.recorded, 5);
        }
    }

    #[test]
    fn aging_triggers_at_sample_size() {
        let mut sketch = FrequencySketch::new(SketchMode::Optimized, 100);
        sketch.sample_size = 8;
        for _ in 0..8 {
            sketch.record(42);
        }
        // The eighth record crossed the threshold and halved the counters.
        assert_eq!(sketch.frequency(42), 4);
        assert_eq!(sketch.recorded, 4);
    }

    #[test]
    fn minimum_geometry_holds_for_tiny_caches() {
        let sketch = FrequencySketch::new(SketchMode::Basic, 0);
        assert_eq!(sketch.counter_mask + 1, 128);
        let sketch = FrequencySketch::new(SketchMode::Optimized, 0);
        assert_eq!(sketch.counter_mask + 1, 128);
    }
}
