//! The receiving side of cross-calls, which runs in trap context.

use core::sync::atomic::Ordering;
use cpu::CpuId;
use log::{error, trace, warn};
use priority_level::{MessageClass, PriorityLevel};

use crate::payload::{ContextVersion, Payload};
use crate::{CrossCallPlatform, CrossCalls};

impl<P: CrossCallPlatform> CrossCalls<P> {
    /// Handles the cross-call trap at `level` on the current CPU.
    ///
    /// The platform's trap entry code must call this whenever a level raised by
    /// [`CrossCallPlatform::raise()`] is taken, and must never call it for a level
    /// at or below the level the CPU is already handling.
    ///
    /// Apart from the rendezvous barrier of a capture, this never waits on anything.
    pub fn handle_trap(&self, level: PriorityLevel) {
        let cpu = self.platform.current_cpu();
        let Some(per_cpu) = self.cpus.get(cpu.index()) else {
            error!("handle_trap(): CPU {} is beyond the {} known CPUs", cpu, self.cpus.len());
            return;
        };
        let Some(class) = MessageClass::from_level(level) else {
            warn!("handle_trap(): no message class is delivered at {} (CPU {})", level, cpu);
            return;
        };

        let previous = self.current_level(cpu);
        if level <= previous {
            error!("BUG: CPU {} entered the {} handler while already handling {}", cpu, level, previous);
            return;
        }
        per_cpu.level.store(level.value(), Ordering::Relaxed);

        match per_cpu.mailbox.take(class) {
            Some(payload) => {
                per_cpu.handled[class.index()].fetch_add(1, Ordering::Relaxed);
                self.execute(cpu, class, payload);
            }
            None => trace!("handle_trap(): spurious {:?} trap on CPU {}", class, cpu),
        }

        per_cpu.level.store(previous.value(), Ordering::Relaxed);
    }

    fn execute(&self, cpu: CpuId, class: MessageClass, payload: Payload) {
        match payload {
            Payload::Call { func, completion } => {
                func(cpu);
                completion.ack(cpu);
            }
            Payload::Signal { from } => {
                trace!("CPU {} received a signal from CPU {}", cpu, from);
                self.platform.wake_local(from);
            }
            Payload::ContextVersion { version, completion } => {
                self.invalidate_local(cpu, version);
                completion.ack(cpu);
            }
            Payload::Capture(ticket) => self.participate(cpu, class, ticket),
            Payload::Device(token) => self.platform.device_irq(token),
        }
    }

    /// Moves `cpu` to context version `new`, dropping any state tagged with its old version first.
    ///
    /// A version never moves backwards, even if bumps arrive out of order.
    pub(crate) fn invalidate_local(&self, cpu: CpuId, new: ContextVersion) {
        let Some(per_cpu) = self.cpus.get(cpu.index()) else { return };
        let old = ContextVersion::new(per_cpu.context_version.load(Ordering::Acquire));
        if old >= new {
            trace!("CPU {} already at context version {} (>= {})", cpu, old, new);
            return;
        }
        self.platform.invalidate_local_context(old, new);
        per_cpu.context_version.fetch_max(new.value(), Ordering::AcqRel);
    }
}
