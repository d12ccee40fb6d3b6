//! Configuration for symmetric multiprocessing and inter-processor cross-calls.

/// The maximum number of CPUs (cores) supported.
///
/// CPU sets are backed by a single `u64`, so this cannot exceed 64.
pub const MAX_CPUS: usize = 64;

/// How long a synchronous cross-call waits for every target to acknowledge
/// before the system is halted, in milliseconds.
///
/// This also bounds how long a sender waits for a busy mailbox slot to drain.
pub const CROSS_CALL_ACK_TIMEOUT_MS: u64 = 1000;

/// How long a capture initiator waits for every participant to arrive
/// at the rendezvous barrier, in milliseconds.
pub const CAPTURE_ARRIVAL_TIMEOUT_MS: u64 = 1000;
