use core::time::Duration;
use cpu::{ActiveCpus, CpuId};
use log::warn;
use priority_level::PriorityLevel;

use crate::error::Fatal;
use crate::payload::ContextVersion;

/// The services cross-calls need from the interrupt controller, the scheduler
/// and the rest of the architecture-specific glue.
///
/// The platform must guarantee that a CPU never enters the trap handler for
/// a level at or below the level it is already handling.
pub trait CrossCallPlatform: Send + Sync {
    /// Returns the id of the CPU executing this call.
    fn current_cpu(&self) -> CpuId;

    /// Returns the set of CPUs that can currently receive cross-calls.
    fn active_cpus(&self) -> &ActiveCpus;

    /// Asks `target` to call [`CrossCalls::handle_trap()`](crate::CrossCalls::handle_trap)
    /// with `level` as soon as its current level permits. Must not wait for that to happen.
    fn raise(&self, target: CpuId, level: PriorityLevel);

    /// Masks every trap at or below `level` on the current CPU, and unmasks those above it.
    ///
    /// Only used outside of trap handlers, when a capture initiator raises its level
    /// for the lifetime of its capture and later restores the previous one.
    fn set_local_level(&self, level: PriorityLevel);

    /// Called on every iteration of every spin-wait.
    ///
    /// Traps above the current CPU's level must be able to arrive during this call.
    fn relax(&self) {
        core::hint::spin_loop();
    }

    /// Returns a monotonically increasing timestamp.
    fn now(&self) -> Duration;

    /// Wakes whatever is blocked on the current CPU, in response to a signal from `from`.
    fn wake_local(&self, from: CpuId);

    /// Drops every piece of the current CPU's cached translation state tagged with
    /// a version older than `new`.
    fn invalidate_local_context(&self, old: ContextVersion, new: ContextVersion);

    /// Handles a device interrupt that was routed through the cross-call slots.
    fn device_irq(&self, token: usize) {
        warn!("Unhandled passthrough device IRQ, token {:#X}", token);
    }

    /// Stops the system after an unrecoverable cross-call failure.
    fn halt(&self, fatal: &Fatal) -> !;
}
