use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::CpuId;

/// A set of CPUs backed by a [`u64`] bitmask.
///
/// Iteration always yields CPUs in increasing [`CpuId`] order.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CpuSet {
    bits: u64,
}

impl CpuSet {
    /// Constructs a new, empty `CpuSet`.
    pub const fn new() -> Self {
        CpuSet { bits: 0 }
    }

    /// Constructs a `CpuSet` from a raw bitmask, in which bit `n` represents CPU `n`.
    pub const fn from_bits(bits: u64) -> Self {
        CpuSet { bits }
    }

    /// Constructs a `CpuSet` containing CPUs `0..count`.
    pub const fn first_n(count: usize) -> Self {
        let bits = if count >= 64 { u64::MAX } else { (1u64 << count) - 1 };
        CpuSet { bits }
    }

    /// Returns the raw bitmask of this set.
    pub const fn bits(&self) -> u64 {
        self.bits
    }

    #[must_use]
    pub const fn contains(&self, cpu: CpuId) -> bool {
        self.bits & bit(cpu) != 0
    }

    pub fn insert(&mut self, cpu: CpuId) {
        self.bits |= bit(cpu);
    }

    pub fn remove(&mut self, cpu: CpuId) {
        self.bits &= !bit(cpu);
    }

    /// Returns a copy of this set with `cpu` removed.
    #[must_use]
    pub const fn without(self, cpu: CpuId) -> Self {
        CpuSet { bits: self.bits & !bit(cpu) }
    }

    /// Returns the CPUs in `self` that are not in `other`.
    #[must_use]
    pub const fn difference(self, other: CpuSet) -> Self {
        CpuSet { bits: self.bits & !other.bits }
    }

    #[must_use]
    pub const fn is_subset(&self, other: &CpuSet) -> bool {
        self.bits & !other.bits == 0
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bits == 0
    }

    /// Returns the lowest-numbered CPU in the set, if any.
    #[must_use]
    pub const fn first(&self) -> Option<CpuId> {
        if self.bits == 0 {
            None
        } else {
            Some(CpuId(self.bits.trailing_zeros()))
        }
    }

    /// Returns an iterator over the CPUs in the set, in increasing order.
    pub const fn iter(&self) -> Iter {
        Iter { remaining: self.bits }
    }
}

const fn bit(cpu: CpuId) -> u64 {
    1u64 << cpu.0
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(CpuId::value)).finish()
    }
}

impl FromIterator<CpuId> for CpuSet {
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self {
        let mut set = CpuSet::new();
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

impl IntoIterator for CpuSet {
    type Item = CpuId;
    type IntoIter = Iter;

    fn into_iter(self) -> Iter {
        self.iter()
    }
}

/// An iterator over a [`CpuSet`], from the lowest CPU to the highest.
pub struct Iter {
    remaining: u64,
}

impl Iterator for Iter {
    type Item = CpuId;

    fn next(&mut self) -> Option<CpuId> {
        if self.remaining == 0 {
            return None;
        }
        let next = self.remaining.trailing_zeros();
        // clear the lowest set bit
        self.remaining &= self.remaining - 1;
        Some(CpuId(next))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining.count_ones() as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for Iter {}

/// A [`CpuSet`] that can be shared and modified concurrently.
pub struct AtomicCpuSet {
    bits: AtomicU64,
}

impl AtomicCpuSet {
    pub const fn new(set: CpuSet) -> Self {
        AtomicCpuSet { bits: AtomicU64::new(set.bits) }
    }

    pub fn load(&self, order: Ordering) -> CpuSet {
        CpuSet::from_bits(self.bits.load(order))
    }

    pub fn store(&self, set: CpuSet, order: Ordering) {
        self.bits.store(set.bits, order)
    }

    /// Adds `cpu` to the set, returning `true` if it was not already present.
    pub fn insert(&self, cpu: CpuId, order: Ordering) -> bool {
        self.bits.fetch_or(bit(cpu), order) & bit(cpu) == 0
    }

    /// Removes `cpu` from the set, returning `true` if it was present.
    pub fn remove(&self, cpu: CpuId, order: Ordering) -> bool {
        self.bits.fetch_and(!bit(cpu), order) & bit(cpu) != 0
    }
}

impl fmt::Debug for AtomicCpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}
