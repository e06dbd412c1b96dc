//! Heartbeat ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::broadcast::BroadcastEngine;
use crate::connection::ClientConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No inbound activity within the pong timeout.
    TimedOut,
    /// A ping could not be queued (queue full or writer gone).
    PingFailed,
    /// The connection was closed by the registry.
    Closed,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

impl HeartbeatResult {
    /// Whether the connection should be declared dead.
    pub fn is_dead(self) -> bool {
        matches!(self, Self::TimedOut | Self::PingFailed)
    }
}

/// Run heartbeat pings for a connection.
///
/// A ping is queued through the broadcast engine every `interval`. Any
/// inbound frame resets the idle clock via [`ClientConnection::mark_alive`].
/// The pong deadline is tracked separately from the ping schedule, so a
/// silent client is reported [`HeartbeatResult::TimedOut`] as soon as it has
/// been idle for `timeout`.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    broadcast: Arc<BroadcastEngine>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if connection.idle_for() >= timeout {
                    return HeartbeatResult::TimedOut;
                }
                if !broadcast.ping(&connection) {
                    return if connection.is_closed() {
                        HeartbeatResult::Closed
                    } else {
                        HeartbeatResult::PingFailed
                    };
                }
            }
            () = time::sleep(timeout.saturating_sub(connection.idle_for())) => {
                if connection.idle_for() >= timeout {
                    return HeartbeatResult::TimedOut;
                }
            }
            () = connection.closed() => {
                return HeartbeatResult::Closed;
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
