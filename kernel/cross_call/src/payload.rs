use alloc::sync::Arc;
use cpu::CpuId;
use derive_more::{Display, From};

use crate::completion::CompletionCounter;

/// A function to be run on a remote CPU, which receives the id of the CPU it runs on.
pub type RemoteFn = Arc<dyn Fn(CpuId) + Send + Sync>;

/// An epoch number for address-space contexts.
///
/// Cached translation state tagged with an older version than a CPU's
/// current version must not be used by that CPU.
#[derive(Clone, Copy, Debug, Default, Display, From, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ContextVersion(u64);

impl ContextVersion {
    pub const fn new(version: u64) -> Self {
        ContextVersion(version)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Identifies one capture, so that a participant knows which release to wait for.
#[derive(Clone, Copy, Debug)]
pub(crate) struct CaptureTicket {
    pub(crate) generation: u64,
    pub(crate) initiator: CpuId,
}

/// The contents of a mailbox slot.
pub(crate) enum Payload {
    /// `RemoteCall` or `RemoteCallSingle`.
    Call {
        func: RemoteFn,
        completion: Arc<CompletionCounter>,
    },
    /// `ReceiveSignal`, carrying the sender.
    Signal {
        from: CpuId,
    },
    /// `ContextVersionBump`.
    ContextVersion {
        version: ContextVersion,
        completion: Arc<CompletionCounter>,
    },
    /// `Capture` or `DebuggerCapture`.
    Capture(CaptureTicket),
    /// `DeviceIrq`; opaque to this crate.
    Device(usize),
}
