//! Graceful shutdown: stop accepting sessions, close every hub connection,
//! then drain the hub's background tasks.

use std::sync::Arc;
use std::time::Duration;

use casehub_hub::Hub;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long background tasks get to finish before they are aborted.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// What a graceful shutdown did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Connections open when the hub was stopped.
    pub connections_closed: usize,
    /// Background tasks waited on.
    pub tasks: usize,
    /// Whether the drain deadline passed and stragglers were aborted.
    pub timed_out: bool,
}

/// Owns the server-wide shutdown signal.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator that has not been triggered.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token the HTTP server waits on.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger shutdown. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been triggered.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop `hub` and wait up to `timeout` for its background `tasks`.
    ///
    /// Tasks still running at the deadline are aborted.
    pub async fn graceful_shutdown(
        &self,
        hub: &Arc<Hub>,
        tasks: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> ShutdownReport {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();

        let connections_closed = hub.connection_count();
        hub.shutdown();

        let task_count = tasks.len();
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        info!(tasks = task_count, timeout = ?timeout, "draining hub tasks");

        let timed_out = tokio::time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_err();
        if timed_out {
            warn!(timeout = ?timeout, "hub tasks did not stop in time, aborting");
            for handle in aborts {
                handle.abort();
            }
        }

        ShutdownReport {
            connections_closed,
            tasks: task_count,
            timed_out,
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
