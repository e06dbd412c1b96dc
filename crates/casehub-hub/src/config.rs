//! Hub runtime configuration.

use std::time::Duration;

use casehub_settings::HubSettings;

/// Timing and capacity knobs for the hub.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Bounded outbound queue length per connection.
    pub outbound_queue_capacity: usize,
    /// Interval between heartbeat pings.
    pub ping_interval: Duration,
    /// Inactivity window after which a connection is dead.
    pub pong_timeout: Duration,
    /// Deadline for a single transport write.
    pub write_timeout: Duration,
    /// Age at which a typing indicator expires.
    pub typing_ttl: Duration,
    /// Interval of the typing expiry sweep.
    pub typing_sweep_interval: Duration,
    /// Page size for undelivered-message fetches.
    pub redelivery_batch_size: usize,
    /// Upper bound of messages replayed per reconnect.
    pub redelivery_max_messages: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from(&HubSettings::default())
    }
}

impl From<&HubSettings> for HubConfig {
    fn from(settings: &HubSettings) -> Self {
        Self {
            outbound_queue_capacity: settings.outbound_queue_capacity.max(1),
            ping_interval: Duration::from_millis(settings.ping_interval_ms),
            pong_timeout: Duration::from_millis(settings.pong_timeout_ms),
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
            typing_ttl: Duration::from_millis(settings.typing_ttl_ms),
            typing_sweep_interval: Duration::from_millis(settings.typing_sweep_interval_ms),
            redelivery_batch_size: settings.redelivery_batch_size.max(1),
            redelivery_max_messages: settings.redelivery_max_messages,
        }
    }
}
