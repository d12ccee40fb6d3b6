//! The sending side of cross-calls.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use cpu::{CpuId, CpuSet};
use log::{debug, trace};
use mailbox::PostError;
use priority_level::MessageClass;

use crate::completion::CompletionCounter;
use crate::error::{CrossCallError, Fatal};
use crate::payload::{ContextVersion, Payload, RemoteFn};
use crate::{CrossCallPlatform, CrossCalls};

/// Which CPUs a message is posted to.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Targets {
    /// Every active CPU except the sender, chosen while holding the active set.
    AllOthers,
    /// Exactly these CPUs, each of which must be active.
    Set(CpuSet),
}

impl<P: CrossCallPlatform> CrossCalls<P> {
    /// Runs `func` on every other active CPU and waits until all of them have run it.
    ///
    /// `class` must be [`MessageClass::RemoteCall`] or [`MessageClass::RemoteCallSingle`].
    pub fn call_all<F>(&self, class: MessageClass, func: F) -> Result<(), CrossCallError>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        self.call(Targets::AllOthers, class, Arc::new(func))
    }

    /// Runs `func` on every CPU in `targets` except the current one,
    /// and waits until all of them have run it.
    pub fn call_many<F>(&self, targets: CpuSet, class: MessageClass, func: F) -> Result<(), CrossCallError>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        let me = self.platform.current_cpu();
        self.call(Targets::Set(targets.without(me)), class, Arc::new(func))
    }

    /// Runs `func` on `target` and waits until it has run.
    ///
    /// If `target` is the current CPU, `func` is simply invoked here.
    pub fn call_one<F>(&self, target: CpuId, class: MessageClass, func: F) -> Result<(), CrossCallError>
    where
        F: Fn(CpuId) + Send + Sync + 'static,
    {
        let me = self.platform.current_cpu();
        if target == me {
            check_call_class(class)?;
            if !self.platform.active_cpus().contains(me) {
                return Err(CrossCallError::TargetUnavailable(me));
            }
            func(me);
            return Ok(());
        }
        self.call(Targets::Set([target].into_iter().collect()), class, Arc::new(func))
    }

    /// Sends a signal to `target`, waking whatever is blocked there.
    ///
    /// This never waits for the target. If a signal is already pending on `target`,
    /// the two are merged into one wakeup.
    pub fn signal(&self, target: CpuId) -> Result<(), CrossCallError> {
        let me = self.platform.current_cpu();
        let class = MessageClass::ReceiveSignal;
        if target == me {
            self.platform.wake_local(me);
            return Ok(());
        }
        let per_cpu = self.per_cpu(target)?;

        let active = self.platform.active_cpus().read();
        if !active.contains(target) {
            return Err(CrossCallError::TargetUnavailable(target));
        }
        match per_cpu.mailbox.post(class, Payload::Signal { from: me }) {
            Ok(()) => {
                trace!("CPU {} signalling CPU {}", me, target);
                self.platform.raise(target, class.level());
            }
            Err(PostError::Busy(_)) => {
                trace!("CPU {}: signal to CPU {} merged with a pending one", me, target);
            }
        }
        Ok(())
    }

    /// Publishes `new_version` as the current context version to every CPU in `targets`,
    /// and waits until each of them has dropped the translation state tagged with its old version.
    ///
    /// If the current CPU is in `targets`, it invalidates its own state before waiting.
    /// Once this returns, no CPU in `targets` will use a version older than `new_version`.
    pub fn bump_context_version(&self, targets: CpuSet, new_version: ContextVersion) -> Result<(), CrossCallError> {
        let me = self.platform.current_cpu();
        let class = MessageClass::ContextVersionBump;
        self.check_level(me, class)?;

        let previous = ContextVersion::new(
            self.context_version.fetch_max(new_version.value(), Ordering::AcqRel)
        );
        if previous >= new_version {
            return Err(CrossCallError::StaleContextVersion { current: previous, requested: new_version });
        }
        debug!("CPU {} bumping context version {} -> {} on {:?}", me, previous, new_version, targets);

        if targets.contains(me) {
            self.invalidate_local(me, new_version);
        }

        let completion = Arc::new(CompletionCounter::new());
        let (_, result) = self.post_all(me, class, Targets::Set(targets.without(me)), Some(&completion), || {
            Payload::ContextVersion { version: new_version, completion: completion.clone() }
        });
        self.wait_for_acks(class, &completion);
        result
    }

    /// Passes an opaque device interrupt `token` to `target` at the device passthrough level.
    ///
    /// This never waits for the target, which may be the current CPU.
    /// Like an interrupt line, the passthrough is level-triggered: while one device
    /// interrupt is still pending on `target`, another one is merged into it and
    /// its token is dropped, leaving the device handler to poll its device.
    pub fn raise_device_irq(&self, target: CpuId, token: usize) -> Result<(), CrossCallError> {
        let me = self.platform.current_cpu();
        let class = MessageClass::DeviceIrq;
        let per_cpu = self.per_cpu(target)?;

        let active = self.platform.active_cpus().read();
        if !active.contains(target) {
            return Err(CrossCallError::TargetUnavailable(target));
        }
        match per_cpu.mailbox.post(class, Payload::Device(token)) {
            Ok(()) => self.platform.raise(target, class.level()),
            Err(PostError::Busy(_)) => {
                trace!("CPU {}: device IRQ {:#X} to CPU {} merged with a pending one", me, token, target);
            }
        }
        Ok(())
    }

    /// The common path of all synchronous remote calls.
    fn call(&self, targets: Targets, class: MessageClass, func: RemoteFn) -> Result<(), CrossCallError> {
        check_call_class(class)?;
        let me = self.platform.current_cpu();
        self.per_cpu(me)?;
        self.check_level(me, class)?;

        let completion = Arc::new(CompletionCounter::new());
        let (posted, result) = self.post_all(me, class, targets, Some(&completion), || {
            Payload::Call { func: func.clone(), completion: completion.clone() }
        });
        trace!("CPU {} waiting for {:?} acknowledgments from {:?}", me, class, posted);
        self.wait_for_acks(class, &completion);
        result
    }

    /// Posts a message made by `make` to each target's mailbox slot for `class`
    /// and raises `class`'s level on it, in increasing CPU order.
    ///
    /// Targets are checked against the active set while it is held, so a CPU cannot go
    /// offline between the check and the post. A target whose slot is still occupied is
    /// retried until its owner drains it; this is how concurrent senders of the same class
    /// to the same CPU are serialized.
    ///
    /// Returns the set of CPUs that were posted to, even if posting to another one failed.
    pub(crate) fn post_all(
        &self,
        me: CpuId,
        class: MessageClass,
        targets: Targets,
        completion: Option<&CompletionCounter>,
        make: impl Fn() -> Payload,
    ) -> (CpuSet, Result<(), CrossCallError>) {
        let level = class.level();
        let mut posted = CpuSet::new();
        let mut remaining = None;
        let mut deadline = self.deadline(self.config.ack_timeout);

        loop {
            {
                let active = self.platform.active_cpus().read();
                let pending = *remaining.get_or_insert_with(|| match targets {
                    Targets::AllOthers => active.without(me),
                    Targets::Set(set) => set,
                });
                if let Some(gone) = pending.difference(*active).first() {
                    debug!("CPU {}: {:?} target CPU {} is not active", me, class, gone);
                    return (posted, Err(CrossCallError::TargetUnavailable(gone)));
                }

                let mut still_busy = CpuSet::new();
                for target in pending {
                    let per_cpu = match self.per_cpu(target) {
                        Ok(p) => p,
                        Err(e) => return (posted, Err(e)),
                    };
                    if let Some(c) = completion {
                        c.expect(target);
                    }
                    match per_cpu.mailbox.post(class, make()) {
                        Ok(()) => {
                            posted.insert(target);
                            self.platform.raise(target, level);
                        }
                        Err(PostError::Busy(_)) => {
                            if let Some(c) = completion {
                                c.cancel(target);
                            }
                            still_busy.insert(target);
                        }
                    }
                }
                remaining = Some(still_busy);
                if still_busy.is_empty() {
                    trace!("CPU {} posted {:?} to {:?}", me, class, posted);
                    return (posted, Ok(()));
                }
            }

            if self.deadline_expired(me, &mut deadline) {
                if let Some(target) = remaining.and_then(|r| r.first()) {
                    self.fatal(Fatal::MailboxStuck { class, target });
                }
            }
            self.platform.relax();
        }
    }

    /// Waits until every target expected by `completion` has acknowledged, or halts.
    fn wait_for_acks(&self, class: MessageClass, completion: &CompletionCounter) {
        if !self.spin_until(self.config.ack_timeout, || completion.is_complete()) {
            if let Some(target) = completion.outstanding().first() {
                self.fatal(Fatal::AckTimeout { class, target });
            }
        }
    }
}

fn check_call_class(class: MessageClass) -> Result<(), CrossCallError> {
    match class {
        MessageClass::RemoteCall | MessageClass::RemoteCallSingle => Ok(()),
        _ => Err(CrossCallError::InvalidClass(class)),
    }
}
