//! Interrupt priority levels and the message classes pinned to them.
//!
//! Every inter-processor message class is delivered at its own priority level.
//! A CPU handling a trap at level `L` can only be interrupted by a level strictly
//! greater than `L`, and a local interrupt disable only masks levels below
//! [`LOCAL_MASK_THRESHOLD`]. The layout of the table therefore decides which
//! messages can be received by a CPU that is busy, masked, or parked in a barrier:
//!
//! ```text
//!  15  DebuggerCapture     <- always preempts everything else, including a Capture
//!  14  (reserved)
//!  13  (reserved)
//!  12  RemoteCallSingle    <- never stuck behind a pending RemoteCall
//!  11  ContextVersionBump  <- serviced by CPUs parked in a Capture
//!  10  RemoteCall
//!   9  ReceiveSignal
//!   8  Capture             <- LOCAL_MASK_THRESHOLD
//!  ---------------------------------------------------------------
//!   7..1  ordinary device levels (DeviceIrq at 5), masked by local disable
//!   0  thread context
//! ```

#![no_std]

#[cfg(test)]
extern crate std;

use core::ops::RangeInclusive;
use derive_more::Display;
use static_assertions::const_assert;

/// An interrupt priority level. Higher values preempt lower values.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display(fmt = "PIL {}", _0)]
#[repr(transparent)]
pub struct PriorityLevel(u8);

/// Levels strictly below this one are blocked while a CPU has its local interrupts disabled.
pub const LOCAL_MASK_THRESHOLD: PriorityLevel = PriorityLevel(8);

/// The range of levels used by ordinary device interrupts.
pub const DEVICE_LEVELS: RangeInclusive<u8> = 1..=7;

/// The range of levels reserved for inter-processor control messages.
pub const CONTROL_LEVELS: RangeInclusive<u8> = 8..=15;

impl PriorityLevel {
    /// The level of ordinary thread context, in which no trap is being handled.
    pub const THREAD: PriorityLevel = PriorityLevel(0);
    /// The highest level that exists.
    pub const MAX: PriorityLevel = PriorityLevel(15);

    /// Returns the level with the given raw value, if it exists.
    pub const fn new(level: u8) -> Option<PriorityLevel> {
        if level <= Self::MAX.0 {
            Some(PriorityLevel(level))
        } else {
            None
        }
    }

    /// Returns the raw value of this level.
    pub const fn value(self) -> u8 {
        self.0
    }

    /// Returns `true` if a local interrupt disable blocks this level.
    pub const fn is_maskable(self) -> bool {
        self.0 < LOCAL_MASK_THRESHOLD.0
    }
}

/// The kinds of messages that one CPU can send to another.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum MessageClass {
    /// Run a function on every other CPU.
    RemoteCall,
    /// Run a function on exactly one other CPU.
    RemoteCallSingle,
    /// Wake up whatever is blocked on the target CPU.
    ReceiveSignal,
    /// Join a general stop-the-world rendezvous.
    Capture,
    /// Drop cached translation state tagged with an outdated context version.
    ContextVersionBump,
    /// An ordinary device interrupt routed through the cross-call slots.
    /// The payload is opaque to this layer.
    DeviceIrq,
    /// Join a debugger halt, which preempts everything else.
    DebuggerCapture,
}

impl MessageClass {
    /// The number of message classes.
    pub const COUNT: usize = 7;

    /// Every message class, in declaration order (which matches [`MessageClass::index()`]).
    pub const ALL: [MessageClass; MessageClass::COUNT] = [
        MessageClass::RemoteCall,
        MessageClass::RemoteCallSingle,
        MessageClass::ReceiveSignal,
        MessageClass::Capture,
        MessageClass::ContextVersionBump,
        MessageClass::DeviceIrq,
        MessageClass::DebuggerCapture,
    ];

    /// Returns the priority level at which this class is delivered.
    pub const fn level(self) -> PriorityLevel {
        PriorityLevel(match self {
            MessageClass::DeviceIrq          => 5,
            MessageClass::Capture            => 8,
            MessageClass::ReceiveSignal      => 9,
            MessageClass::RemoteCall         => 10,
            MessageClass::ContextVersionBump => 11,
            MessageClass::RemoteCallSingle   => 12,
            MessageClass::DebuggerCapture    => 15,
        })
    }

    /// Returns a dense index in `0..COUNT`, usable for per-class arrays.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Returns the message class delivered at `level`, if any.
    pub const fn from_level(level: PriorityLevel) -> Option<MessageClass> {
        let mut i = 0;
        while i < Self::COUNT {
            if Self::ALL[i].level().0 == level.0 {
                return Some(Self::ALL[i]);
            }
            i += 1;
        }
        None
    }

    /// Returns `true` if this class is an inter-processor control message,
    /// i.e., it must get through even while the target has interrupts disabled.
    pub const fn is_control(self) -> bool {
        !matches!(self, MessageClass::DeviceIrq)
    }
}

/// Returns `true` if no two message classes share a level.
const fn levels_are_distinct() -> bool {
    let mut i = 0;
    while i < MessageClass::COUNT {
        let mut j = i + 1;
        while j < MessageClass::COUNT {
            if MessageClass::ALL[i].level().0 == MessageClass::ALL[j].level().0 {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

/// Returns `true` if the debugger capture level is strictly above every other class.
const fn debugger_capture_dominates() -> bool {
    let top = MessageClass::DebuggerCapture.level().0;
    let mut i = 0;
    while i < MessageClass::COUNT {
        let class = MessageClass::ALL[i];
        if !matches!(class, MessageClass::DebuggerCapture) && class.level().0 >= top {
            return false;
        }
        i += 1;
    }
    true
}

/// Returns `true` if every control class sits in the control range and the
/// device passthrough sits in the device range.
const fn classes_are_in_their_ranges() -> bool {
    let mut i = 0;
    while i < MessageClass::COUNT {
        let class = MessageClass::ALL[i];
        let level = class.level().0;
        let ok = if class.is_control() {
            level >= *CONTROL_LEVELS.start() && level <= *CONTROL_LEVELS.end()
        } else {
            level >= *DEVICE_LEVELS.start() && level <= *DEVICE_LEVELS.end()
        };
        if !ok {
            return false;
        }
        i += 1;
    }
    true
}

const_assert!(levels_are_distinct());
const_assert!(debugger_capture_dominates());
const_assert!(classes_are_in_their_ranges());
const_assert!(MessageClass::DebuggerCapture.level().0 == PriorityLevel::MAX.0);
const_assert!(MessageClass::Capture.level().0 == LOCAL_MASK_THRESHOLD.0);
const_assert!(MessageClass::RemoteCallSingle.level().0 > MessageClass::RemoteCall.level().0);
const_assert!(MessageClass::ContextVersionBump.level().0 > MessageClass::Capture.level().0);
