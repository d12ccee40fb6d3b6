//! SMP cross-calls: urgent messages from one CPU to others, delivered at dedicated
//! interrupt priority levels so that they get through even while the target CPU
//! has its ordinary interrupts disabled.
//!
//! The pieces, from sender to receiver:
//! * The sending side ([`CrossCalls::call_all()`], [`CrossCalls::call_one()`],
//!   [`CrossCalls::signal()`], [`CrossCalls::bump_context_version()`], ...)
//!   posts a message into each target CPU's [`Mailbox`] and raises the
//!   priority level of the message's [`MessageClass`] on that CPU.
//! * The receiving side, [`CrossCalls::handle_trap()`], is invoked by the platform's
//!   trap entry code at that level; it takes the message out of the local mailbox and runs it.
//! * Synchronous senders spin until every target has acknowledged, or halt the system
//!   if that takes too long.
//! * [`CrossCalls::capture()`] and [`CrossCalls::debugger_capture()`] build a
//!   stop-the-world rendezvous on top of the above.
//!
//! Everything hardware-specific is supplied by a [`CrossCallPlatform`].
//!
//! ## Waiting
//! Nothing in here ever blocks on a lock. All waiting is done by spinning,
//! and every spin iteration calls [`CrossCallPlatform::relax()`], during which
//! traps above the CPU's current level must be able to arrive.
//! For the same reason, a synchronous cross-call may only be issued from a level
//! strictly below its class's level; see [`CrossCallError::LevelTooHigh`].

#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

mod capture;
mod completion;
mod config;
mod delivery;
mod dispatch;
mod error;
mod payload;
mod platform;

#[cfg(test)]
mod sim;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use core::time::Duration;
use cpu::{CpuId, MAX_CPUS};
use log::error;
use mailbox::Mailbox;

use crate::capture::CaptureBarrier;
use crate::payload::Payload;

pub use capture::CaptureGuard;
pub use completion::CompletionCounter;
pub use config::CrossCallConfig;
pub use error::{CrossCallError, Fatal};
pub use payload::{ContextVersion, RemoteFn};
pub use platform::CrossCallPlatform;
pub use priority_level::{MessageClass, PriorityLevel};

/// The cross-call state for an entire system: one [`Mailbox`] and trap state per CPU,
/// plus the global capture barriers and the latest context version.
pub struct CrossCalls<P: CrossCallPlatform> {
    platform: P,
    cpus: Vec<PerCpu>,
    capture: CaptureBarrier,
    debugger: CaptureBarrier,
    context_version: AtomicU64,
    config: CrossCallConfig,
}

/// State owned by one CPU.
struct PerCpu {
    mailbox: Mailbox<Payload>,
    /// The level this CPU runs at: that of the trap being handled, or of a capture
    /// it is initiating or holding, else `0`. Only ever written by the owning CPU.
    level: AtomicU8,
    /// The context version this CPU's cached translation state is tagged with.
    context_version: AtomicU64,
    handled: [AtomicU64; MessageClass::COUNT],
}

impl PerCpu {
    fn new() -> Self {
        PerCpu {
            mailbox: Mailbox::new(),
            level: AtomicU8::new(PriorityLevel::THREAD.value()),
            context_version: AtomicU64::new(0),
            handled: core::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

/// A timeout that is paused while other CPUs' captures stop the system.
struct Deadline {
    timeout: Duration,
    /// `None` until the clock (re)starts.
    expires: Option<Duration>,
    captures_seen: u64,
}

/// Counts of the messages a CPU has handled, per class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CrossCallStats {
    handled: [u64; MessageClass::COUNT],
}

impl CrossCallStats {
    pub fn handled(&self, class: MessageClass) -> u64 {
        self.handled[class.index()]
    }

    pub fn total(&self) -> u64 {
        self.handled.iter().sum()
    }
}

impl<P: CrossCallPlatform> CrossCalls<P> {
    /// Creates the cross-call state for a system with CPUs `0..cpu_count`.
    pub fn new(platform: P, cpu_count: usize, config: CrossCallConfig) -> Result<Self, &'static str> {
        if cpu_count == 0 {
            return Err("CrossCalls::new(): cpu_count must be at least 1");
        }
        if cpu_count > MAX_CPUS {
            return Err("CrossCalls::new(): cpu_count exceeds MAX_CPUS");
        }
        Ok(CrossCalls {
            platform,
            cpus: (0..cpu_count).map(|_| PerCpu::new()).collect(),
            capture: CaptureBarrier::new(MessageClass::Capture),
            debugger: CaptureBarrier::new(MessageClass::DebuggerCapture),
            context_version: AtomicU64::new(0),
            config,
        })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &CrossCallConfig {
        &self.config
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Returns the level `cpu` currently runs at: that of the cross-call trap it is handling
    /// or of the capture it holds, else [`PriorityLevel::THREAD`].
    pub fn current_level(&self, cpu: CpuId) -> PriorityLevel {
        self.cpus
            .get(cpu.index())
            .and_then(|c| PriorityLevel::new(c.level.load(Ordering::Relaxed)))
            .unwrap_or(PriorityLevel::THREAD)
    }

    /// Returns the latest context version published by [`CrossCalls::bump_context_version()`].
    pub fn context_version(&self) -> ContextVersion {
        ContextVersion::new(self.context_version.load(Ordering::Acquire))
    }

    /// Returns the context version that `cpu`'s cached translation state is tagged with.
    pub fn local_context_version(&self, cpu: CpuId) -> Option<ContextVersion> {
        self.cpus
            .get(cpu.index())
            .map(|c| ContextVersion::new(c.context_version.load(Ordering::Acquire)))
    }

    /// Returns `true` if a message of `class` is waiting in `cpu`'s mailbox.
    pub fn is_pending(&self, cpu: CpuId, class: MessageClass) -> bool {
        self.cpus
            .get(cpu.index())
            .map_or(false, |c| c.mailbox.is_pending(class))
    }

    /// Returns how many messages of each class `cpu` has handled so far.
    pub fn stats(&self, cpu: CpuId) -> Option<CrossCallStats> {
        let per_cpu = self.cpus.get(cpu.index())?;
        let mut stats = CrossCallStats::default();
        for class in MessageClass::ALL {
            stats.handled[class.index()] = per_cpu.handled[class.index()].load(Ordering::Relaxed);
        }
        Some(stats)
    }

    fn per_cpu(&self, cpu: CpuId) -> Result<&PerCpu, CrossCallError> {
        self.cpus.get(cpu.index()).ok_or(CrossCallError::UnknownCpu(cpu))
    }

    /// Ensures that `cpu` may wait on messages of `class`, i.e., that it is
    /// running below `class`'s level and will thus keep receiving that class while it spins.
    fn check_level(&self, cpu: CpuId, class: MessageClass) -> Result<(), CrossCallError> {
        let current = self.current_level(cpu);
        if current >= class.level() {
            return Err(CrossCallError::LevelTooHigh { current, class });
        }
        Ok(())
    }

    /// Spins until `done` returns `true` or `timeout` elapses.
    ///
    /// The timeout only runs while no other CPU's capture is stopping the system,
    /// and starts over after any capture, since the CPUs we are waiting on may have
    /// been stopped for an arbitrarily long time.
    ///
    /// Returns whether `done` was satisfied.
    fn spin_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let me = self.platform.current_cpu();
        let mut deadline = self.deadline(timeout);
        loop {
            if done() {
                return true;
            }
            if self.deadline_expired(me, &mut deadline) {
                return done();
            }
            self.platform.relax();
        }
    }

    fn deadline(&self, timeout: Duration) -> Deadline {
        Deadline {
            timeout,
            expires: None,
            captures_seen: self.capture_generations(),
        }
    }

    /// Returns `true` once `deadline` has run out on `cpu`.
    ///
    /// Must be checked after every [`CrossCallPlatform::relax()`], which may have
    /// parked this CPU in a capture for any length of time.
    fn deadline_expired(&self, cpu: CpuId, deadline: &mut Deadline) -> bool {
        let captures = self.capture_generations();
        if captures != deadline.captures_seen || self.stopped_by_other_capture(cpu) {
            deadline.captures_seen = captures;
            deadline.expires = None;
            return false;
        }
        let now = self.platform.now();
        match deadline.expires {
            Some(expires) => now >= expires,
            None => {
                deadline.expires = Some(now.saturating_add(deadline.timeout));
                false
            }
        }
    }

    /// Sets the level `cpu` runs at outside of [`CrossCalls::handle_trap()`],
    /// returning the previous one. `cpu` must be the current CPU.
    fn set_level(&self, cpu: CpuId, level: PriorityLevel) -> PriorityLevel {
        let previous = self.current_level(cpu);
        if let Some(per_cpu) = self.cpus.get(cpu.index()) {
            per_cpu.level.store(level.value(), Ordering::Relaxed);
            self.platform.set_local_level(level);
        }
        previous
    }

    /// Spins until `done` returns `true`, with no upper bound.
    fn spin_until_unbounded(&self, mut done: impl FnMut() -> bool) {
        while !done() {
            self.platform.relax();
        }
    }

    /// Reports an unrecoverable loss of processor coherency and halts.
    fn fatal(&self, fatal: Fatal) -> ! {
        error!("cross-call fatal error on CPU {}: {}", self.platform.current_cpu(), fatal);
        self.platform.halt(&fatal)
    }
}
