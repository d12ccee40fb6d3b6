//! Stop-the-world rendezvous ("capture") of every active CPU.
//!
//! There are two independent barriers: the general [`MessageClass::Capture`] and the
//! [`MessageClass::DebuggerCapture`], whose level dominates everything else.
//! At most one capture of each kind is in progress at a time.
//!
//! A CPU parked in a capture keeps spinning at the capture's level, so it still handles
//! every higher class, including a debugger capture. In that case it joins the debugger
//! barrier from inside the first one, and only goes back to waiting on the first barrier
//! once the debugger releases it. The initiator of a capture is treated the same way:
//! if a debugger capture reaches it while it is gathering or holding its own capture,
//! it parks in the debugger barrier and resumes afterwards.
//! A general capture is never released while another CPU's debugger capture is in progress.
//!
//! From the moment it owns a barrier until it releases it, an initiator runs at
//! the capture's level, so it never parks in a capture of the same or a lower kind
//! while other CPUs are parked waiting on it.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use cpu::{AtomicCpuSet, CpuId, CpuSet, OptionalCpuId};
use crossbeam_utils::atomic::AtomicCell;
use log::{debug, trace};
use priority_level::{MessageClass, PriorityLevel};
use static_assertions::const_assert;

use crate::dispatch::Targets;
use crate::error::{CrossCallError, Fatal};
use crate::payload::{CaptureTicket, Payload};
use crate::{CrossCallPlatform, CrossCalls};

// Ensure that `AtomicCell<OptionalCpuId>` is actually a lock-free atomic.
const_assert!(AtomicCell::<OptionalCpuId>::is_lock_free());

/// The global state of one kind of capture.
pub(crate) struct CaptureBarrier {
    class: MessageClass,
    /// Set by the initiator for the whole lifetime of a capture.
    in_progress: AtomicBool,
    initiator: AtomicCell<OptionalCpuId>,
    /// How many guards the initiator currently holds for this capture.
    depth: AtomicUsize,
    /// The generation of the most recently started capture.
    generation: AtomicU64,
    /// The generation of the most recently released capture.
    released: AtomicU64,
    /// The participants that have arrived at the current capture.
    arrived: AtomicCpuSet,
    /// The initiator's level from before it took this barrier.
    saved_level: AtomicU8,
}

impl CaptureBarrier {
    pub(crate) const fn new(class: MessageClass) -> Self {
        CaptureBarrier {
            class,
            in_progress: AtomicBool::new(false),
            initiator: AtomicCell::new(OptionalCpuId::NONE),
            depth: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            released: AtomicU64::new(0),
            arrived: AtomicCpuSet::new(CpuSet::new()),
            saved_level: AtomicU8::new(PriorityLevel::THREAD.value()),
        }
    }

    fn initiator(&self) -> Option<CpuId> {
        self.initiator.load().into()
    }

    fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }
}

/// Keeps every other active CPU parked until dropped.
///
/// Must be dropped on the CPU that acquired it.
pub struct CaptureGuard<'a, P: CrossCallPlatform> {
    xcalls: &'a CrossCalls<P>,
    class: MessageClass,
    generation: u64,
    _not_send: PhantomData<*const ()>,
}

impl<'a, P: CrossCallPlatform> CaptureGuard<'a, P> {
    pub fn class(&self) -> MessageClass {
        self.class
    }
}

impl<'a, P: CrossCallPlatform> Drop for CaptureGuard<'a, P> {
    fn drop(&mut self) {
        self.xcalls.release(self.class, self.generation);
    }
}

impl<P: CrossCallPlatform> CrossCalls<P> {
    /// Brings every other active CPU to a halt and keeps it there until the returned guard is dropped.
    ///
    /// If another CPU's capture is in progress, this CPU first takes part in that one.
    /// Capturing again while already holding a capture just nests.
    pub fn capture(&self) -> Result<CaptureGuard<'_, P>, CrossCallError> {
        self.begin_capture(MessageClass::Capture)
    }

    /// Like [`CrossCalls::capture()`], but at the highest priority level,
    /// so it also stops CPUs that are parked in, or initiating, a regular capture.
    pub fn debugger_capture(&self) -> Result<CaptureGuard<'_, P>, CrossCallError> {
        self.begin_capture(MessageClass::DebuggerCapture)
    }

    pub fn capture_in_progress(&self) -> bool {
        self.capture.is_in_progress()
    }

    pub fn debugger_capture_in_progress(&self) -> bool {
        self.debugger.is_in_progress()
    }

    /// Returns a value that changes whenever any capture begins.
    pub(crate) fn capture_generations(&self) -> u64 {
        self.capture.generation.load(Ordering::Acquire)
            .wrapping_add(self.debugger.generation.load(Ordering::Acquire))
    }

    /// Returns `true` if another CPU's capture that can stop `cpu` is in progress.
    pub(crate) fn stopped_by_other_capture(&self, cpu: CpuId) -> bool {
        let level = self.current_level(cpu);
        [&self.capture, &self.debugger].into_iter().any(|b| {
            b.class.level() > level && b.is_in_progress() && b.initiator() != Some(cpu)
        })
    }

    fn barrier(&self, class: MessageClass) -> &CaptureBarrier {
        match class {
            MessageClass::DebuggerCapture => &self.debugger,
            _ => &self.capture,
        }
    }

    fn begin_capture(&self, class: MessageClass) -> Result<CaptureGuard<'_, P>, CrossCallError> {
        let me = self.platform.current_cpu();
        self.per_cpu(me)?;
        let barrier = self.barrier(class);

        if barrier.is_in_progress() && barrier.initiator() == Some(me) {
            let depth = barrier.depth.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("CPU {} nested {:?} (depth {})", me, class, depth);
            return Ok(CaptureGuard {
                xcalls: self,
                class,
                generation: barrier.generation.load(Ordering::Acquire),
                _not_send: PhantomData,
            });
        }
        self.check_level(me, class)?;

        // While someone else owns this barrier we keep handling traps,
        // so we end up parked in their capture until they release it.
        self.spin_until_unbounded(|| {
            barrier.in_progress
                .compare_exchange_weak(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        });

        let generation = barrier.generation.fetch_add(1, Ordering::AcqRel) + 1;
        barrier.initiator.store(Some(me).into());
        barrier.depth.store(1, Ordering::Relaxed);
        barrier.arrived.store(CpuSet::new(), Ordering::Release);
        let previous = self.set_level(me, class.level());
        barrier.saved_level.store(previous.value(), Ordering::Relaxed);
        let guard = CaptureGuard { xcalls: self, class, generation, _not_send: PhantomData };

        let ticket = CaptureTicket { generation, initiator: me };
        let (posted, result) = self.post_all(me, class, Targets::AllOthers, None, || Payload::Capture(ticket));

        let arrived = self.spin_until(self.config.capture_timeout, || {
            posted.is_subset(&barrier.arrived.load(Ordering::Acquire))
        });
        if !arrived {
            let missing = posted.difference(barrier.arrived.load(Ordering::Acquire));
            self.fatal(Fatal::CaptureTimeout { class, missing });
        }

        debug!("CPU {} captured {:?} with {:?} (generation {})", me, posted, class, generation);
        result.map(|()| guard)
    }

    /// Parks `cpu` in the capture identified by `ticket` until its initiator releases it.
    pub(crate) fn participate(&self, cpu: CpuId, class: MessageClass, ticket: CaptureTicket) {
        let barrier = self.barrier(class);
        trace!("CPU {} arriving at {:?} of CPU {} (generation {})", cpu, class, ticket.initiator, ticket.generation);
        barrier.arrived.insert(cpu, Ordering::AcqRel);
        self.spin_until_unbounded(|| barrier.released.load(Ordering::Acquire) >= ticket.generation);
        trace!("CPU {} released from {:?} (generation {})", cpu, class, ticket.generation);
    }

    fn release(&self, class: MessageClass, generation: u64) {
        let barrier = self.barrier(class);
        if barrier.depth.fetch_sub(1, Ordering::Relaxed) > 1 {
            return;
        }

        let me = self.platform.current_cpu();
        if class == MessageClass::Capture {
            // A debugger capture that overlaps this one must finish first.
            // If it has not reached us yet, it will while we spin.
            self.spin_until_unbounded(|| {
                !self.debugger.is_in_progress() || self.debugger.initiator() == Some(me)
            });
        }

        barrier.initiator.store(OptionalCpuId::NONE);
        barrier.released.store(generation, Ordering::Release);
        barrier.in_progress.store(false, Ordering::Release);
        let previous = PriorityLevel::new(barrier.saved_level.load(Ordering::Relaxed))
            .unwrap_or(PriorityLevel::THREAD);
        self.set_level(me, previous);
        debug!("{:?} generation {} released", barrier.class, generation);
    }
}
