//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` for the JSON file
//! format and implement [`Default`] with production values. Every struct is
//! `#[serde(default)]`, so a partial file only overrides what it names.

mod hub;
mod server;

pub use hub::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9090 },
///   "hub": { "typingTtlMs": 8000 },
///   "store": { "backend": "memory" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CasehubSettings {
    /// HTTP/WebSocket listener settings.
    pub server: ServerSettings,
    /// Connection hub tuning.
    pub hub: HubSettings,
    /// Message store selection.
    pub store: StoreSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl CasehubSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.hub.outbound_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.outboundQueueCapacity must be at least 1".into(),
            ));
        }
        if self.hub.pong_timeout_ms <= self.hub.ping_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "hub.pongTimeoutMs ({}) must exceed hub.pingIntervalMs ({})",
                self.hub.pong_timeout_ms, self.hub.ping_interval_ms
            )));
        }
        if self.hub.redelivery_batch_size == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.redeliveryBatchSize must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}
