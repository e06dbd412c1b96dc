//! Live client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use casehub_core::{CaseId, ConnectionId, UserId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A frame queued for the connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Serialized envelope, shared across every recipient of a broadcast.
    Text(Arc<String>),
    /// Transport-level ping.
    Ping,
}

/// One live transport session for a (user, case) pair.
///
/// The hub never touches the socket. It pushes [`OutboundFrame`]s into the
/// bounded queue, and the transport's writer task drains it. Closing only
/// signals the session through [`closed`](Self::closed).
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Verified identity of the remote user.
    pub user: UserId,
    /// Case this connection is scoped to.
    pub case_id: CaseId,
    tx: mpsc::Sender<OutboundFrame>,
    /// When this connection was established.
    pub connected_at: Instant,
    last_activity: Mutex<Instant>,
    dropped_messages: AtomicU64,
    evicting: AtomicBool,
    close: CancellationToken,
}

impl ClientConnection {
    /// Create a connection around an existing queue sender.
    pub fn new(user: UserId, case_id: CaseId, tx: mpsc::Sender<OutboundFrame>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            user,
            case_id,
            tx,
            connected_at: now,
            last_activity: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            evicting: AtomicBool::new(false),
            close: CancellationToken::new(),
        }
    }

    /// Create a connection with a fresh bounded queue of `capacity` frames.
    pub fn with_capacity(
        user: UserId,
        case_id: CaseId,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(user, case_id, tx)), rx)
    }

    /// Enqueue a text frame without waiting.
    ///
    /// Returns `false` if the queue is full or closed, and increments the
    /// dropped message counter.
    pub fn send(&self, message: Arc<String>) -> bool {
        self.enqueue(OutboundFrame::Text(message))
    }

    /// Enqueue a ping frame without waiting.
    pub fn send_ping(&self) -> bool {
        self.enqueue(OutboundFrame::Ping)
    }

    fn enqueue(&self, frame: OutboundFrame) -> bool {
        if self.close.is_cancelled() {
            return false;
        }
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound activity (any frame, including pongs).
    pub fn mark_alive(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last inbound activity (or establishment).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// Flag the connection for eviction.
    ///
    /// Returns `true` only for the first caller, so an eviction is requested
    /// at most once however many broadcasts hit the full queue.
    pub fn mark_evicting(&self) -> bool {
        !self.evicting.swap(true, Ordering::AcqRel)
    }

    /// Whether an eviction has been requested.
    pub fn is_evicting(&self) -> bool {
        self.evicting.load(Ordering::Acquire)
    }

    /// Signal the transport session to shut down. Idempotent.
    pub(crate) fn close(&self) {
        self.close.cancel();
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolves once the connection is closed by the registry.
    pub async fn closed(&self) {
        self.close.cancelled().await;
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("user", &self.user)
            .field("case_id", &self.case_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
