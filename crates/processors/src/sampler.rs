//! Uniform sampling without replacement from a large implicit integer
//! domain, plus the mixed-radix encoding that maps histogram cell
//! coordinates onto that domain.

use std::collections::HashMap;

use rand::Rng;

/// Encode `digits` under the given per-position `bases` into a single
/// integer. Position 0 is the most significant digit.
pub fn mixed_radix_to_int(digits: &[u64], bases: &[u64]) -> u64 {
    debug_assert_eq!(digits.len(), bases.len());
    let mut value = 0u64;
    for (digit, base) in digits.iter().zip(bases) {
        debug_assert!(digit < base);
        value = value * base + digit;
    }
    value
}

/// Decode `value` back into digits under `bases`. Inverse of
/// [`mixed_radix_to_int`] for any value below the product of the bases.
pub fn mixed_radix_from_int(mut value: u64, bases: &[u64]) -> Vec<u64> {
    let mut digits = vec![0u64; bases.len()];
    for (slot, base) in digits.iter_mut().zip(bases).rev() {
        *slot = value % base;
        value /= base;
    }
    digits
}

/// Draws distinct integers uniformly from `0..domain` minus an exclusion
/// set, in O(1) memory per draw. Excluded and already-drawn values are
/// swapped out of the active range through a sparse pass-through remap, so
/// the domain itself is never materialized.
pub struct WorSampler {
    end: u64,
    remap: HashMap<u64, u64>,
}

impl WorSampler {
    pub fn new(domain: u64, exclude: &[u64]) -> Self {
        let mut sampler = WorSampler {
            end: domain,
            remap: HashMap::new(),
        };
        // Dedup and retire from the high end down; before any draw an
        // excluded value still occupies its own slot.
        let mut excluded: Vec<u64> = exclude.iter().copied().filter(|v| *v < domain).collect();
        excluded.sort_unstable();
        excluded.dedup();
        for value in excluded.into_iter().rev() {
            sampler.retire_slot(value);
        }
        sampler
    }

    /// Values still available to draw.
    pub fn remaining(&self) -> u64 {
        self.end
    }

    pub fn draw<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<u64> {
        if self.end == 0 {
            return None;
        }
        let slot = rng.gen_range(0..self.end);
        let value = self.resolve(slot);
        self.retire_slot(slot);
        Some(value)
    }

    fn resolve(&self, slot: u64) -> u64 {
        self.remap.get(&slot).copied().unwrap_or(slot)
    }

    /// Remove a slot from the active range by remapping it to whatever
    /// currently occupies the last active slot.
    fn retire_slot(&mut self, slot: u64) {
        self.end -= 1;
        let tail = self.resolve(self.end);
        self.remap.remove(&self.end);
        if slot < self.end {
            self.remap.insert(slot, tail);
        }
    }
}
