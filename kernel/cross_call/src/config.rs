use core::time::Duration;
use kernel_config::smp::{CAPTURE_ARRIVAL_TIMEOUT_MS, CROSS_CALL_ACK_TIMEOUT_MS};

/// Runtime tunables for cross-calls.
///
/// The defaults come from [`kernel_config::smp`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrossCallConfig {
    /// How long a synchronous call waits for acknowledgments,
    /// and how long a sender waits for a busy mailbox slot to drain.
    pub ack_timeout: Duration,
    /// How long a capture initiator waits for every participant to arrive.
    pub capture_timeout: Duration,
}

impl CrossCallConfig {
    pub const fn new() -> Self {
        CrossCallConfig {
            ack_timeout: Duration::from_millis(CROSS_CALL_ACK_TIMEOUT_MS),
            capture_timeout: Duration::from_millis(CAPTURE_ARRIVAL_TIMEOUT_MS),
        }
    }

    pub const fn with_ack_timeout(self, ack_timeout: Duration) -> Self {
        CrossCallConfig { ack_timeout, ..self }
    }

    pub const fn with_capture_timeout(self, capture_timeout: Duration) -> Self {
        CrossCallConfig { capture_timeout, ..self }
    }
}

impl Default for CrossCallConfig {
    fn default() -> Self {
        CrossCallConfig::new()
    }
}
