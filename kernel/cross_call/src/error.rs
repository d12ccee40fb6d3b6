use core::fmt;
use cpu::{CpuId, CpuSet};
use priority_level::{MessageClass, PriorityLevel};

use crate::payload::ContextVersion;

/// Recoverable errors returned to the issuer of a cross-call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrossCallError {
    /// The target CPU was not in the active set when the message was to be posted.
    /// The caller may retry against a refreshed active set.
    TargetUnavailable(CpuId),
    /// The CPU id is beyond the number of CPUs this system was set up with.
    UnknownCpu(CpuId),
    /// The message class cannot be used with the requested operation.
    InvalidClass(MessageClass),
    /// The caller is handling a trap at or above `class`'s level, so it could never
    /// receive messages of that class from other CPUs while it waits.
    LevelTooHigh {
        current: PriorityLevel,
        class: MessageClass,
    },
    /// The requested context version is not newer than the latest published one.
    StaleContextVersion {
        current: ContextVersion,
        requested: ContextVersion,
    },
}

impl fmt::Display for CrossCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrossCallError::TargetUnavailable(cpu) => write!(f, "CPU {} is not active", cpu),
            CrossCallError::UnknownCpu(cpu) => write!(f, "CPU {} does not exist", cpu),
            CrossCallError::InvalidClass(class) => write!(f, "{} is not valid for this operation", class),
            CrossCallError::LevelTooHigh { current, class } => write!(
                f, "cannot wait on {} ({}) while handling {}", class, class.level(), current,
            ),
            CrossCallError::StaleContextVersion { current, requested } => write!(
                f, "context version {} is not newer than {}", requested, current,
            ),
        }
    }
}

/// Unrecoverable loss of processor coherency.
///
/// These are never returned; they are logged and handed to
/// [`CrossCallPlatform::halt()`](crate::CrossCallPlatform::halt).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fatal {
    /// `target` did not acknowledge a synchronous message of `class` in time.
    AckTimeout {
        class: MessageClass,
        target: CpuId,
    },
    /// `target` never drained its mailbox slot for `class`, so a new message could not be posted.
    MailboxStuck {
        class: MessageClass,
        target: CpuId,
    },
    /// The CPUs in `missing` did not arrive at a `class` rendezvous in time.
    CaptureTimeout {
        class: MessageClass,
        missing: CpuSet,
    },
}

impl fmt::Display for Fatal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fatal::AckTimeout { class, target } => write!(
                f, "{} was not acknowledged by CPU {}", class, target,
            ),
            Fatal::MailboxStuck { class, target } => write!(
                f, "{} mailbox slot of CPU {} never drained", class, target,
            ),
            Fatal::CaptureTimeout { class, missing } => write!(
                f, "{} rendezvous timed out waiting for CPUs {:?}", class, missing,
            ),
        }
    }
}
