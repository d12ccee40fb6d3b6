use log::{debug, warn};
use spin::{RwLock, RwLockReadGuard};

use crate::{CpuId, CpuSet};

/// The set of CPUs that are currently online and able to receive cross-calls.
///
/// Senders that must check membership and then act on it (e.g., post a message
/// to a CPU's mailbox) should hold the guard returned by [`ActiveCpus::read()`]
/// across both steps, so that a CPU cannot be taken offline in between.
pub struct ActiveCpus {
    set: RwLock<CpuSet>,
}

impl ActiveCpus {
    /// Creates an empty active set.
    pub const fn new() -> Self {
        ActiveCpus { set: RwLock::new(CpuSet::new()) }
    }

    /// Creates an active set that initially contains the given CPUs.
    pub const fn with_cpus(set: CpuSet) -> Self {
        ActiveCpus { set: RwLock::new(set) }
    }

    /// Marks `cpu` as online.
    ///
    /// Returns an error if it was already online.
    pub fn online(&self, cpu: CpuId) -> Result<(), &'static str> {
        let mut set = self.set.write();
        if set.contains(cpu) {
            warn!("ActiveCpus::online(): CPU {} was already online", cpu);
            return Err("Tried to bring the same CpuId online twice");
        }
        set.insert(cpu);
        debug!("CPU {} is now online, active set: {:?}", cpu, *set);
        Ok(())
    }

    /// Marks `cpu` as offline.
    ///
    /// Returns an error if it was not online.
    pub fn offline(&self, cpu: CpuId) -> Result<(), &'static str> {
        let mut set = self.set.write();
        if !set.contains(cpu) {
            return Err("Tried to take an inactive CpuId offline");
        }
        set.remove(cpu);
        debug!("CPU {} is now offline, active set: {:?}", cpu, *set);
        Ok(())
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        self.set.read().contains(cpu)
    }

    /// Returns a copy of the current active set.
    ///
    /// The returned set may be stale as soon as this returns.
    pub fn snapshot(&self) -> CpuSet {
        *self.set.read()
    }

    /// Returns the number of active CPUs.
    pub fn count(&self) -> usize {
        self.set.read().len()
    }

    /// Locks the active set against concurrent changes for as long as the guard lives.
    pub fn read(&self) -> RwLockReadGuard<'_, CpuSet> {
        self.set.read()
    }
}

impl Default for ActiveCpus {
    fn default() -> Self {
        ActiveCpus::new()
    }
}
