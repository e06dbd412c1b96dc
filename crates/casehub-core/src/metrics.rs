//! Metric name constants to avoid typos across crates.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connection lifetime in seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Outbound frames dropped on a full or closed queue (counter).
pub const WS_BROADCAST_DROPS_TOTAL: &str = "ws_broadcast_drops_total";
/// Connections forcibly removed (counter, labels: reason).
pub const WS_EVICTIONS_TOTAL: &str = "ws_evictions_total";
/// Inbound frames that failed to decode (counter).
pub const WS_MALFORMED_FRAMES_TOTAL: &str = "ws_malformed_frames_total";
/// Typing indicators expired by the sweep (counter).
pub const TYPING_EXPIRED_TOTAL: &str = "typing_expired_total";
/// Queued messages pushed on reconnect (counter).
pub const REDELIVERED_MESSAGES_TOTAL: &str = "redelivered_messages_total";
/// Message store failures during redelivery or acks (counter, labels: op).
pub const STORE_ERRORS_TOTAL: &str = "store_errors_total";
