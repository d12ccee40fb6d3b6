//! Per-CPU mailboxes for inter-processor messages.
//!
//! Each CPU owns one [`Mailbox`], which holds exactly one [`Slot`] per [`MessageClass`].
//! A slot carries at most one message at a time:
//! * any CPU may [`post`](Mailbox::post) into an empty slot,
//! * only the owning CPU [`take`](Mailbox::take)s from it, from within the trap handler
//!   for that class's priority level.
//!
//! Posting and raising the interrupt that makes the owner look at its mailbox
//! are deliberately separate steps; the latter is up to the sender.
//!
//! Ownership of a slot's contents is handed back and forth by its state word,
//! so no lock is ever held, which matters because the receiving side runs at trap level.

#![no_std]

#[cfg(test)]
extern crate std;

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use priority_level::MessageClass;

/// The slot holds nothing and may be posted into.
const EMPTY: u8 = 0;
/// A sender is storing a message; nobody else may touch the contents.
const WRITING: u8 = 1;
/// A message is waiting for the owning CPU.
const PENDING: u8 = 2;
/// The owning CPU is moving the message out; nobody else may touch the contents.
const TAKING: u8 = 3;

/// The error returned by [`Mailbox::post()`] when the slot is still occupied.
///
/// The rejected message is handed back so the sender can retry later.
pub enum PostError<T> {
    Busy(T),
}

impl<T> PostError<T> {
    /// Returns the message that could not be posted.
    pub fn into_inner(self) -> T {
        match self {
            PostError::Busy(msg) => msg,
        }
    }
}

impl<T> fmt::Debug for PostError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Busy(..)")
    }
}

/// A single-writer, single-reader handoff cell for one message.
pub struct Slot<T> {
    state: AtomicU8,
    contents: UnsafeCell<Option<T>>,
}

// SAFETY: the contents are only accessed by whoever moved `state` into WRITING or TAKING,
// and both transitions are exclusive compare-exchanges, so the contents are never shared.
unsafe impl<T: Send> Send for Slot<T> {}
// SAFETY: see above; `T` is moved between CPUs, never referenced from two of them.
unsafe impl<T: Send> Sync for Slot<T> {}

impl<T> Slot<T> {
    pub const fn new() -> Self {
        Slot {
            state: AtomicU8::new(EMPTY),
            contents: UnsafeCell::new(None),
        }
    }

    /// Stores `msg` in this slot if it is empty.
    pub fn post(&self, msg: T) -> Result<(), PostError<T>> {
        if self.state.compare_exchange(EMPTY, WRITING, Ordering::Acquire, Ordering::Relaxed).is_err() {
            return Err(PostError::Busy(msg));
        }
        // SAFETY: we own the contents while the state is WRITING.
        unsafe { *self.contents.get() = Some(msg) };
        self.state.store(PENDING, Ordering::Release);
        Ok(())
    }

    /// Removes and returns the pending message, if any.
    pub fn take(&self) -> Option<T> {
        if self.state.compare_exchange(PENDING, TAKING, Ordering::Acquire, Ordering::Relaxed).is_err() {
            return None;
        }
        // SAFETY: we own the contents while the state is TAKING.
        let msg = unsafe { (*self.contents.get()).take() };
        self.state.store(EMPTY, Ordering::Release);
        msg
    }

    /// Returns `true` if a message is waiting in this slot.
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    /// Returns `true` if nothing is stored in or being moved through this slot.
    pub fn is_empty(&self) -> bool {
        self.state.load(Ordering::Acquire) == EMPTY
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Slot::new()
    }
}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Ordering::Relaxed) {
            EMPTY => "Empty",
            WRITING => "Writing",
            PENDING => "Pending",
            TAKING => "Taking",
            _ => "Invalid",
        };
        write!(f, "Slot::{}", state)
    }
}

/// One CPU's set of message slots, one per [`MessageClass`].
pub struct Mailbox<T> {
    slots: [Slot<T>; MessageClass::COUNT],
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Mailbox {
            slots: core::array::from_fn(|_| Slot::new()),
        }
    }

    /// Posts `msg` into the slot for `class`.
    ///
    /// Returns [`PostError::Busy`] with the message if the slot still holds
    /// a message that its owner has not yet taken.
    pub fn post(&self, class: MessageClass, msg: T) -> Result<(), PostError<T>> {
        self.slot(class).post(msg)
    }

    /// Takes the pending message for `class`, leaving the slot empty.
    ///
    /// Must only be called by the CPU that owns this mailbox,
    /// from within its trap handler for `class`.
    pub fn take(&self, class: MessageClass) -> Option<T> {
        self.slot(class).take()
    }

    pub fn is_pending(&self, class: MessageClass) -> bool {
        self.slot(class).is_pending()
    }

    /// Returns an iterator over the classes that currently have a pending message.
    pub fn pending(&self) -> impl Iterator<Item = MessageClass> + '_ {
        MessageClass::ALL.into_iter().filter(move |class| self.is_pending(*class))
    }

    pub fn slot(&self, class: MessageClass) -> &Slot<T> {
        &self.slots[class.index()]
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Mailbox::new()
    }
}

impl<T> fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.pending()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::vec::Vec;
    use super::*;

    #[test]
    fn post_then_take() {
        let mailbox = Mailbox::new();
        assert_eq!(mailbox.take(MessageClass::RemoteCall), None::<u32>);
        mailbox.post(MessageClass::RemoteCall, 42).unwrap();
        assert!(mailbox.is_pending(MessageClass::RemoteCall));
        assert!(!mailbox.is_pending(MessageClass::ReceiveSignal));
        assert_eq!(mailbox.take(MessageClass::RemoteCall), Some(42));
        assert_eq!(mailbox.take(MessageClass::RemoteCall), None);
        assert!(mailbox.slot(MessageClass::RemoteCall).is_empty());
    }

    #[test]
    fn second_post_is_busy_and_returns_the_message() {
        let mailbox = Mailbox::new();
        mailbox.post(MessageClass::RemoteCallSingle, 1).unwrap();
        let rejected = mailbox.post(MessageClass::RemoteCallSingle, 2).unwrap_err();
        assert_eq!(rejected.into_inner(), 2);
        // the first message was not overwritten
        assert_eq!(mailbox.take(MessageClass::RemoteCallSingle), Some(1));
        mailbox.post(MessageClass::RemoteCallSingle, 2).unwrap();
        assert_eq!(mailbox.take(MessageClass::RemoteCallSingle), Some(2));
    }

    #[test]
    fn classes_are_independent() {
        let mailbox = Mailbox::new();
        for (i, class) in MessageClass::ALL.into_iter().enumerate() {
            mailbox.post(class, i).unwrap();
        }
        assert_eq!(mailbox.pending().count(), MessageClass::COUNT);
        for (i, class) in MessageClass::ALL.into_iter().enumerate() {
            assert_eq!(mailbox.take(class), Some(i));
        }
        assert_eq!(mailbox.pending().count(), 0);
    }

    #[test]
    fn pending_message_is_dropped_with_the_mailbox() {
        let token = Arc::new(());
        {
            let mailbox = Mailbox::new();
            mailbox.post(MessageClass::Capture, token.clone()).unwrap();
            assert_eq!(Arc::strong_count(&token), 2);
        }
        assert_eq!(Arc::strong_count(&token), 1);
    }

    /// Many senders race on one slot while a single receiver drains it:
    /// every message must arrive exactly once.
    #[test]
    fn concurrent_senders_single_receiver() {
        const SENDERS: usize = 4;
        const PER_SENDER: usize = 500;

        let mailbox = Arc::new(Mailbox::<usize>::new());
        let received = Arc::new(AtomicUsize::new(0));

        let receiver = {
            let mailbox = mailbox.clone();
            let received = received.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < SENDERS * PER_SENDER {
                    if let Some(msg) = mailbox.take(MessageClass::RemoteCallSingle) {
                        seen.push(msg);
                        received.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::yield_now();
                }
                seen
            })
        };

        let senders: Vec<_> = (0..SENDERS).map(|s| {
            let mailbox = mailbox.clone();
            thread::spawn(move || {
                for i in 0..PER_SENDER {
                    let mut msg = s * PER_SENDER + i;
                    loop {
                        match mailbox.post(MessageClass::RemoteCallSingle, msg) {
                            Ok(()) => break,
                            Err(e) => msg = e.into_inner(),
                        }
                        thread::yield_now();
                    }
                }
            })
        }).collect();

        for s in senders {
            s.join().unwrap();
        }
        let mut seen = receiver.join().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (0..SENDERS * PER_SENDER).collect::<Vec<_>>());
        assert_eq!(received.load(Ordering::SeqCst), SENDERS * PER_SENDER);
    }
}
