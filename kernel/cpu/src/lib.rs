//! Types for identifying CPUs (cores) in an SMP multicore system
//! and for tracking which of them are currently active.
//!
//! Unlike the per-architecture register readers, nothing here touches hardware:
//! the platform glue decides which [`CpuId`] the current core has and
//! calls [`ActiveCpus::online()`] / [`ActiveCpus::offline()`] as cores come and go.

#![no_std]

#[cfg(test)]
extern crate std;

mod active;
mod set;

use core::fmt;
use derive_more::{Display, Binary, Octal, LowerHex, UpperHex};

pub use active::ActiveCpus;
pub use set::{AtomicCpuSet, CpuSet, Iter};
pub use kernel_config::smp::MAX_CPUS;

/// A unique identifier for a CPU.
///
/// CPU ids are dense, starting from zero, and always less than [`MAX_CPUS`].
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord,
    Hash, Binary, Octal, LowerHex, UpperHex,
)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    /// Creates a new `CpuId`.
    ///
    /// Panics if `id` is not less than [`MAX_CPUS`].
    pub const fn new(id: u32) -> Self {
        assert!((id as usize) < MAX_CPUS, "CpuId must be less than MAX_CPUS");
        CpuId(id)
    }

    /// Returns the raw `u32` value of this `CpuId`.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Returns this `CpuId` as an index usable for per-CPU arrays.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u32> for CpuId {
    type Error = &'static str;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        if (id as usize) < MAX_CPUS {
            Ok(CpuId(id))
        } else {
            Err("CpuId value exceeded MAX_CPUS")
        }
    }
}

impl From<CpuId> for u32 {
    fn from(cpu: CpuId) -> Self {
        cpu.0
    }
}

/// An equivalent to `Option<CpuId>`, which internally encodes `None` as `u32::MAX`.
///
/// This guarantees that it compiles down to lock-free native atomic instructions
/// when using it inside of an atomic type like `AtomicCell`.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct OptionalCpuId(u32);

impl OptionalCpuId {
    pub const NONE: OptionalCpuId = OptionalCpuId(u32::MAX);
}

impl From<Option<CpuId>> for OptionalCpuId {
    fn from(opt: Option<CpuId>) -> Self {
        match opt {
            Some(cpu) => OptionalCpuId(cpu.0),
            None => OptionalCpuId::NONE,
        }
    }
}

impl From<OptionalCpuId> for Option<CpuId> {
    fn from(val: OptionalCpuId) -> Self {
        match val.0 {
            u32::MAX => None,
            id => Some(CpuId(id)),
        }
    }
}

impl fmt::Debug for OptionalCpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", Option::<CpuId>::from(*self))
    }
}
