use core::sync::atomic::{AtomicUsize, Ordering};
use cpu::{AtomicCpuSet, CpuId, CpuSet};
use log::warn;

/// Tracks which targets of one synchronous cross-call have acknowledged it.
///
/// The sender marks each target as outstanding right before posting to it,
/// and each target acknowledges once after handling the message.
/// The call is complete when no target is outstanding.
#[derive(Debug)]
pub struct CompletionCounter {
    outstanding: AtomicCpuSet,
    acks: AtomicUsize,
}

impl CompletionCounter {
    pub fn new() -> Self {
        CompletionCounter {
            outstanding: AtomicCpuSet::new(CpuSet::new()),
            acks: AtomicUsize::new(0),
        }
    }

    /// Marks `cpu` as a target that must acknowledge.
    pub fn expect(&self, cpu: CpuId) {
        self.outstanding.insert(cpu, Ordering::AcqRel);
    }

    /// Stops expecting an acknowledgment from `cpu`, whose message was never posted.
    pub fn cancel(&self, cpu: CpuId) {
        self.outstanding.remove(cpu, Ordering::AcqRel);
    }

    /// Records that `cpu` has handled the message.
    ///
    /// Returns `false`, and counts nothing, if `cpu` was not outstanding.
    pub fn ack(&self, cpu: CpuId) -> bool {
        if self.outstanding.remove(cpu, Ordering::AcqRel) {
            self.acks.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            warn!("CompletionCounter: ignoring unexpected acknowledgment from CPU {}", cpu);
            false
        }
    }

    /// Returns `true` once every expected target has acknowledged.
    pub fn is_complete(&self) -> bool {
        self.outstanding.load(Ordering::Acquire).is_empty()
    }

    /// Returns the targets that have not yet acknowledged.
    pub fn outstanding(&self) -> CpuSet {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Returns the number of acknowledgments received so far.
    pub fn acks(&self) -> usize {
        self.acks.load(Ordering::Acquire)
    }
}

impl Default for CompletionCounter {
    fn default() -> Self {
        CompletionCounter::new()
    }
}
