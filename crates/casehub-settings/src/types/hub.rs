use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Connection hub tuning. Durations are milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Bounded outbound queue length per connection.
    pub outbound_queue_capacity: usize,
    /// Interval between server pings.
    pub ping_interval_ms: u64,
    /// Inactivity window after which a connection is declared dead.
    pub pong_timeout_ms: u64,
    /// Deadline for a single transport write.
    pub write_timeout_ms: u64,
    /// Age at which a typing indicator expires.
    pub typing_ttl_ms: u64,
    /// Interval of the typing expiry sweep.
    pub typing_sweep_interval_ms: u64,
    /// Page size for undelivered-message fetches.
    pub redelivery_batch_size: usize,
    /// Upper bound of messages replayed per reconnect.
    pub redelivery_max_messages: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: 256,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 60_000,
            write_timeout_ms: 10_000,
            typing_ttl_ms: 10_000,
            typing_sweep_interval_ms: 5_000,
            redelivery_batch_size: 100,
            redelivery_max_messages: 1_000,
        }
    }
}

/// Which message store backs redelivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// `SQLite` file at [`StoreSettings::path`].
    #[default]
    Sqlite,
    /// Process-local store, lost on restart.
    Memory,
}

/// Message store selection.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// Backend kind.
    pub backend: StoreBackend,
    /// Database file for the `SQLite` backend.
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            backend: StoreBackend::Sqlite,
            path: PathBuf::from(home).join(".casehub").join("messages.db"),
        }
    }
}
