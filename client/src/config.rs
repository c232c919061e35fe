use std::time::Duration;

/// Timing knobs for a sync session.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Minimum spacing between outbound pose writes
    pub publish_interval: Duration,
    /// How long a chat bubble stays above an avatar
    pub bubble_lifetime: Duration,
    /// Deadline for a single store request over the network
    pub request_timeout: Duration,
    /// Keep-alive period towards the store server
    pub heartbeat_interval: Duration,
    /// Retry period for feeds that have ended
    pub resubscribe_interval: Duration,
    /// How often expired bubbles are swept
    pub bubble_sweep_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_millis(100),
            bubble_lifetime: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            resubscribe_interval: Duration::from_secs(1),
            bubble_sweep_interval: Duration::from_millis(250),
        }
    }
}
