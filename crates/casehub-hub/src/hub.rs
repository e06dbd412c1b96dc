//! The hub facade.
//!
//! [`Hub`] wires the registry, membership index, broadcast engine, presence
//! and delivery trackers together. It owns the unregister cascade (group
//! removal, typing cleanup, `user_left` notices), the eviction worker that
//! drains the broadcast engine's eviction requests, and the hub-wide
//! shutdown token.

use std::sync::{Arc, Weak};
use std::time::Duration;

use casehub_core::metrics::{STORE_ERRORS_TOTAL, WS_EVICTIONS_TOTAL};
use casehub_core::{CaseId, ClientCommand, GroupId, HubEvent, UserId};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastEngine, EvictionReceiver};
use crate::config::HubConfig;
use crate::connection::{ClientConnection, OutboundFrame};
use crate::delivery::{DeliveryTracker, RedeliveryReport};
use crate::errors::Result;
use crate::liveness::{self, HeartbeatResult};
use crate::membership::GroupMembershipIndex;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::store::{MessageStore, StoreError};

/// The real-time connection and messaging hub.
pub struct Hub {
    config: HubConfig,
    registry: Arc<ConnectionRegistry>,
    membership: Arc<GroupMembershipIndex>,
    broadcast: Arc<BroadcastEngine>,
    presence: Arc<PresenceTracker>,
    delivery: DeliveryTracker,
    evictions: Mutex<Option<EvictionReceiver>>,
    /// Serializes the unregister cascade against joins.
    lifecycle: Mutex<()>,
    shutdown: CancellationToken,
    connected: Notify,
}

impl Hub {
    /// Build a hub backed by `store`. Call [`start`](Self::start) to run
    /// the background tasks.
    pub fn new(config: HubConfig, store: Arc<dyn MessageStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let membership = Arc::new(GroupMembershipIndex::new());
        let (engine, evictions) = BroadcastEngine::new(registry.clone(), membership.clone());
        let broadcast = Arc::new(engine);
        let presence = Arc::new(PresenceTracker::new(broadcast.clone(), config.typing_ttl));
        let delivery = DeliveryTracker::new(store, broadcast.clone(), &config);

        Self {
            config,
            registry,
            membership,
            broadcast,
            presence,
            delivery,
            evictions: Mutex::new(Some(evictions)),
            lifecycle: Mutex::new(()),
            shutdown: CancellationToken::new(),
            connected: Notify::new(),
        }
    }

    /// Spawn the typing sweep and the eviction worker.
    ///
    /// Both stop on [`shutdown`](Self::shutdown). Calling this twice only
    /// starts a second sweep; the eviction worker runs once.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(self.presence.clone().run_sweep(
            self.config.typing_sweep_interval,
            self.shutdown.child_token(),
        ))];

        if let Some(rx) = self.evictions.lock().take() {
            handles.push(tokio::spawn(run_eviction_worker(
                Arc::downgrade(self),
                rx,
                self.shutdown.child_token(),
            )));
        } else {
            warn!("eviction worker already running");
        }
        handles
    }

    // ── connections ──

    /// Register a new connection for (user, case) with a fresh outbound
    /// queue. A previous connection for the same key is closed.
    pub fn register(
        &self,
        user: UserId,
        case_id: CaseId,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<OutboundFrame>) {
        let (conn, rx) =
            ClientConnection::with_capacity(user, case_id, self.config.outbound_queue_capacity);
        if self.registry.register(conn.clone()).is_some() {
            counter!(WS_EVICTIONS_TOTAL, "reason" => "duplicate_login").increment(1);
        }
        self.connected.notify_waiters();
        (conn, rx)
    }

    /// Remove whatever connection is registered for (user, case) and run
    /// the cascade. Returns whether a connection existed.
    pub fn unregister(&self, user: &UserId, case_id: &CaseId) -> bool {
        if self.registry.unregister(user, case_id).is_none() {
            return false;
        }
        self.cascade(user, case_id);
        true
    }

    /// Remove `conn` if it is still the registered connection for its key
    /// and run the cascade. A superseded connection is only closed.
    pub fn unregister_connection(&self, conn: &ClientConnection) -> bool {
        if !self.registry.unregister_connection(conn) {
            return false;
        }
        self.cascade(&conn.user, &conn.case_id);
        true
    }

    /// Drop `user`'s memberships and typing state in `case_id` and tell the
    /// remaining members. Skipped when a newer connection already holds the
    /// key.
    fn cascade(&self, user: &UserId, case_id: &CaseId) {
        let (groups, cleared) = {
            let _guard = self.lifecycle.lock();
            if self.registry.lookup(user, case_id).is_some() {
                debug!(user = %user, case_id = %case_id, "reconnected before cleanup, cascade skipped");
                return;
            }
            let groups = self.membership.remove_user_from_case(user, case_id);
            let cleared = self.presence.clear_user(user, &groups);
            (groups, cleared)
        };
        for group_id in &groups {
            self.announce(
                group_id,
                &HubEvent::UserLeft {
                    group_id: group_id.clone(),
                    user: user.clone(),
                },
                user,
            );
        }
        info!(
            user = %user,
            case_id = %case_id,
            groups = groups.len(),
            typing_cleared = cleared,
            "connection unregistered"
        );
    }

    fn evict(&self, conn: &ClientConnection) {
        if self.unregister_connection(conn) {
            counter!(WS_EVICTIONS_TOTAL, "reason" => "backpressure").increment(1);
            warn!(
                conn_id = %conn.id,
                user = %conn.user,
                case_id = %conn.case_id,
                dropped = conn.drop_count(),
                "evicted unresponsive connection"
            );
        } else {
            debug!(conn_id = %conn.id, "eviction skipped, connection already gone");
        }
    }

    /// Run the heartbeat for `conn` until it dies, closes or the hub shuts
    /// down.
    pub async fn heartbeat(&self, conn: Arc<ClientConnection>) -> HeartbeatResult {
        let result = liveness::run_heartbeat(
            conn.clone(),
            self.broadcast.clone(),
            self.config.ping_interval,
            self.config.pong_timeout,
            self.shutdown.child_token(),
        )
        .await;

        match result {
            HeartbeatResult::TimedOut => {
                counter!(WS_EVICTIONS_TOTAL, "reason" => "timeout").increment(1);
                warn!(conn_id = %conn.id, user = %conn.user, idle = ?conn.idle_for(), "client unresponsive, disconnecting");
            }
            HeartbeatResult::PingFailed => {
                counter!(WS_EVICTIONS_TOTAL, "reason" => "ping_failed").increment(1);
                warn!(conn_id = %conn.id, user = %conn.user, "heartbeat ping could not be queued");
            }
            HeartbeatResult::Closed | HeartbeatResult::Cancelled => {}
        }
        result
    }

    // ── membership ──

    /// Add `user` to `group_id` under `case_id`. Other members are told
    /// with `user_joined` when the membership is new.
    pub fn join(&self, user: &UserId, group_id: &GroupId, case_id: &CaseId) -> Result<bool> {
        let joined = {
            let _guard = self.lifecycle.lock();
            self.membership.join(user, group_id, case_id)?
        };
        if joined {
            debug!(user = %user, group_id = %group_id, case_id = %case_id, "joined group");
            self.announce(
                group_id,
                &HubEvent::UserJoined {
                    group_id: group_id.clone(),
                    user: user.clone(),
                },
                user,
            );
        }
        Ok(joined)
    }

    /// Remove `user` from `group_id`, clearing any typing indicator there.
    pub fn leave(&self, user: &UserId, group_id: &GroupId) -> bool {
        if !self.membership.leave(user, group_id) {
            return false;
        }
        let _ = self.presence.clear_typing(user, group_id);
        self.announce(
            group_id,
            &HubEvent::UserLeft {
                group_id: group_id.clone(),
                user: user.clone(),
            },
            user,
        );
        true
    }

    fn announce(&self, group_id: &GroupId, event: &HubEvent, except: &UserId) {
        if let Err(e) = self.broadcast.send_to_group_except(group_id, event, except)
            && !e.is_not_found()
        {
            warn!(group_id = %group_id, error = %e, "failed to announce membership change");
        }
    }

    // ── inbound ──

    /// Route a decoded client command from `conn`.
    pub async fn dispatch(&self, conn: &Arc<ClientConnection>, command: ClientCommand) {
        match command {
            ClientCommand::Typing { group_id } => {
                if !self.authorized(conn, &group_id) {
                    return;
                }
                if let Err(e) = self.presence.set_typing(&conn.user, &group_id) {
                    self.reply_error(conn, Some(group_id), e.to_string());
                }
            }
            ClientCommand::StopTyping { group_id } => {
                if self.authorized(conn, &group_id) {
                    let _ = self.presence.clear_typing(&conn.user, &group_id);
                }
            }
            ClientCommand::Delivered { message_id } => {
                match self.delivery.ack_delivered(&message_id, &conn.user).await {
                    Ok(()) => debug!(user = %conn.user, message_id = %message_id, "delivery acknowledged"),
                    Err(StoreError::MessageNotFound(_)) => {
                        warn!(user = %conn.user, message_id = %message_id, "ack for unknown message");
                    }
                    Err(e) => {
                        counter!(STORE_ERRORS_TOTAL, "op" => "ack").increment(1);
                        warn!(user = %conn.user, message_id = %message_id, error = %e, "failed to record delivery ack");
                    }
                }
            }
            ClientCommand::Ping => {
                let _ = self.broadcast.send_to_connection(conn, &HubEvent::Pong);
            }
            ClientCommand::Pong => conn.mark_alive(),
        }
    }

    fn authorized(&self, conn: &Arc<ClientConnection>, group_id: &GroupId) -> bool {
        let in_case = self.membership.case_of(group_id).as_ref() == Some(&conn.case_id);
        if in_case && self.membership.is_member(&conn.user, group_id) {
            return true;
        }
        debug!(user = %conn.user, group_id = %group_id, "command for a group the connection is not in");
        self.reply_error(conn, Some(group_id.clone()), format!("not a member of group {group_id}"));
        false
    }

    fn reply_error(&self, conn: &Arc<ClientConnection>, group_id: Option<GroupId>, message: String) {
        let _ = self
            .broadcast
            .send_to_connection(conn, &HubEvent::Error { group_id, message });
    }

    /// Replay queued messages to a freshly registered user.
    pub async fn deliver_queued(&self, user: &UserId) -> RedeliveryReport {
        self.delivery.deliver_queued(user).await
    }

    // ── queries ──

    /// Resolve `true` once any connection exists for `case_id`, or `false`
    /// after `timeout`.
    pub async fn wait_for_client(&self, case_id: &CaseId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.connected.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();

            if self.registry.count_for_case(case_id) > 0 {
                return true;
            }
            if time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Live connections scoped to `case_id`.
    pub fn count_clients(&self, case_id: &CaseId) -> usize {
        self.registry.count_for_case(case_id)
    }

    /// Users connected to `case_id`, sorted.
    pub fn connected_users(&self, case_id: &CaseId) -> Vec<UserId> {
        self.registry.connected_users(case_id)
    }

    /// Total live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Number of live groups.
    pub fn group_count(&self) -> usize {
        self.membership.group_count()
    }

    /// Hub configuration.
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Membership index.
    pub fn membership(&self) -> &Arc<GroupMembershipIndex> {
        &self.membership
    }

    /// Broadcast engine.
    pub fn broadcast(&self) -> &Arc<BroadcastEngine> {
        &self.broadcast
    }

    /// Presence tracker.
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    // ── shutdown ──

    /// Stop the background tasks and close every connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let closed = self.registry.close_all();
        info!(connections = closed, "hub shutting down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

async fn run_eviction_worker(
    hub: Weak<Hub>,
    mut rx: EvictionReceiver,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            conn = rx.recv() => {
                let Some(conn) = conn else { break };
                let Some(hub) = hub.upgrade() else { break };
                hub.evict(&conn);
            }
            () = cancel.cancelled() => break,
        }
    }
    debug!("eviction worker stopped");
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::store::{MemoryMessageStore, StoredMessage};
    use serde_json::{Value, json};

    fn hub_with(store: Arc<MemoryMessageStore>) -> Arc<Hub> {
        Arc::new(Hub::new(HubConfig::default(), store))
    }

    fn hub() -> Arc<Hub> {
        hub_with(Arc::new(MemoryMessageStore::new()))
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundFrame>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn of_type<'a>(frames: &'a [Value], kind: &str) -> Vec<&'a Value> {
        frames.iter().filter(|f| f["type"] == kind).collect()
    }

    async fn settle<F: Fn() -> bool>(done: F) {
        time::timeout(Duration::from_secs(1), async {
            while !done() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    // ── registration ──

    #[tokio::test]
    async fn duplicate_login_closes_first_connection() {
        let hub = hub();
        let (first, _r1) = hub.register("a".into(), "C1".into());
        let (second, _r2) = hub.register("a".into(), "C1".into());

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(hub.connection_count(), 1);
        // the superseded session's teardown leaves the new one in place
        assert!(!hub.unregister_connection(&first));
        assert_eq!(hub.count_clients(&"C1".into()), 1);
    }

    #[tokio::test]
    async fn duplicate_login_keeps_memberships() {
        let hub = hub();
        let (first, _r1) = hub.register("a".into(), "C1".into());
        hub.join(&"a".into(), &"G1".into(), &"C1".into()).unwrap();
        let (_second, _r2) = hub.register("a".into(), "C1".into());
        hub.unregister_connection(&first);
        assert!(hub.membership().is_member(&"a".into(), &"G1".into()));
    }

    #[tokio::test]
    async fn late_cascade_spares_a_reconnected_session() {
        let hub = hub();
        let (old, _r_old) = hub.register("a".into(), "C1".into());
        let (_b, mut rx_b) = hub.register("b".into(), "C1".into());
        hub.join(&"a".into(), &"G1".into(), &"C1".into()).unwrap();
        hub.join(&"b".into(), &"G1".into(), &"C1".into()).unwrap();
        drain(&mut rx_b);

        // old entry gone, its cleanup still pending while the user reconnects
        assert!(hub.registry().unregister_connection(&old));
        let (_new, _r_new) = hub.register("a".into(), "C1".into());
        hub.join(&"a".into(), &"G1".into(), &"C1".into()).unwrap();
        hub.cascade(&"a".into(), &"C1".into());

        assert!(hub.membership().is_member(&"a".into(), &"G1".into()));
        assert!(of_type(&drain(&mut rx_b), "user_left").is_empty());
    }

    #[tokio::test]
    async fn cascade_runs_once_the_key_is_free() {
        let hub = hub();
        let (old, _r_old) = hub.register("a".into(), "C1".into());
        hub.join(&"a".into(), &"G1".into(), &"C1".into()).unwrap();
        assert!(hub.registry().unregister_connection(&old));

        hub.cascade(&"a".into(), &"C1".into());
        assert!(!hub.membership().is_member(&"a".into(), &"G1".into()));
    }

    #[tokio::test]
    async fn unregister_cascades_membership_and_typing() {
        let hub = hub();
        let (_a, mut rx_a) = hub.register("a".into(), "C1".into());
        let (_b, _rx_b) = hub.register("b".into(), "C1".into());
        hub.join(&"a".into(), &"G1".into(), &"C1".into()).unwrap();
        hub.join(&"b".into(), &"G1".into(), &"C1".into()).unwrap();
        hub.presence().set_typing(&"b".into(), &"G1".into()).unwrap();
        drain(&mut rx_a);

        assert!(hub.unregister(&"b".into(), &"C1".into()));
        assert!(!hub.unregister(&"b".into(), &"C1".into()));

        assert_eq!(hub.membership().members_of(&"G1".into()).unwrap(), vec![UserId::from("a")]);
        assert!(!hub.presence().is_typing(&"b".into(), &"G1".into()));
        let frames = drain(&mut rx_a);
        assert_eq!(of_type(&frames, "stop_typing").len(), 1);
        assert_eq!(of_type(&frames, "user_left").len(), 1);
        assert_eq!(frames.last().unwrap()["user_email"], "b");

        let fan_out = hub
            .broadcast()
            .send_to_group(&"G1".into(), &HubEvent::Pong)
            .unwrap();
        assert_eq!(fan_out.delivered, 1);
    }

    #[tokio::test]
    async fn cascade_only_touches_the_connection_case() {
        let hub = hub();
        let (_c1, _r1) = hub.register("a".into(), "C1".into());
        let (_c2, _r2) = hub.register("a".into(), "C2".into());
        hub.join(&"a".into(), &"G1".into(), &"C1".into()).unwrap();
        hub.join(&"a".into(), &"G2".into(), &"C2".into()).unwrap();

        hub.unregister(&"a".into(), &"C1".into());
        assert_eq!(hub.membership().groups_of_user(&"a".into()), vec![GroupId::from("G2")]);
    }

    // ── membership ──

    #[tokio::test]
    async fn join_and_leave_notify_other_members() {
        let hub = hub();
        let (_a, mut rx_a) = hub.register("a".into(), "C1".into());
        let (_b, mut rx_b) = hub.register("b".into(), "C1".into());
        hub.join(&"a".into(), &"G1".into(), &"C1".into()).unwrap();
        hub.join(&"b".into(), &"G1".into(), &"C1".into()).unwrap();
        assert!(!hub.join(&"b".into(), &"G1".into(), &"C1".into()).unwrap());

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "user_joined");
        assert_eq!(frames[0]["user_email"], "b");
        assert!(drain(&mut rx_b).is_empty());

        assert!(hub.leave(&"b".into(), &"G1".into()));
        assert!(!hub.leave(&"b".into(), &"G1".into()));
        let frames = drain(&mut rx_a);
        assert_eq!(of_type(&frames, "user_left").len(), 1);
    }

    #[tokio::test]
    async fn join_under_wrong_case_fails() {
        let hub = hub();
        hub.join(&"a".into(), &"G1".into(), &"C1".into()).unwrap();
        let err = hub.join(&"b".into(), &"G1".into(), &"C2".into()).unwrap_err();
        assert!(matches!(err, crate::HubError::CaseMismatch { .. }));
    }

    // ── dispatch ──

    #[tokio::test(start_paused = true)]
    async fn typing_without_renewal_expires_once() {
        let hub = hub();
        let _tasks = hub.start();
        let (a, _rx_a) = hub.register("a".into(), "C1".into());
        let (_b, mut rx_b) = hub.register("b".into(), "C1".into());
        hub.join(&"a".into(), &"G1".into(), &"C1".into()).unwrap();
        hub.join(&"b".into(), &"G1".into(), &"C1".into()).unwrap();

        hub.dispatch(&a, ClientCommand::Typing { group_id: "G1".into() }).await;
        let frames = drain(&mut rx_b);
        assert_eq!(of_type(&frames, "typing").len(), 1);

        time::sleep(Duration::from_secs(11)).await;
        let frames = drain(&mut rx_b);
        let stops = of_type(&frames, "stop_typing");
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0]["payload"]["is_typing"], false);

        time::sleep(Duration::from_secs(30)).await;
        assert!(of_type(&drain(&mut rx_b), "stop_typing").is_empty());
        hub.shutdown();
    }

    #[tokio::test]
    async fn typing_in_foreign_group_is_rejected() {
        let hub = hub();
        let (a, mut rx_a) = hub.register("a".into(), "C1".into());
        hub.join(&"b".into(), &"G1".into(), &"C1".into()).unwrap();

        hub.dispatch(&a, ClientCommand::Typing { group_id: "G1".into() }).await;
        hub.dispatch(&a, ClientCommand::Typing { group_id: "G9".into() }).await;

        assert!(hub.presence().is_empty());
        let frames = drain(&mut rx_a);
        assert_eq!(of_type(&frames, "error").len(), 2);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let hub = hub();
        let (a, mut rx_a) = hub.register("a".into(), "C1".into());
        hub.dispatch(&a, ClientCommand::Ping).await;
        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "pong");
    }

    #[tokio::test(start_paused = true)]
    async fn pong_marks_connection_alive() {
        let hub = hub();
        let (a, _rx) = hub.register("a".into(), "C1".into());
        time::advance(Duration::from_secs(20)).await;
        hub.dispatch(&a, ClientCommand::Pong).await;
        assert!(a.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn delivered_ack_marks_store() {
        let store = Arc::new(MemoryMessageStore::new());
        let msg = StoredMessage::new("G1".into(), "a".into(), json!({ "text": "hi" }));
        let id = msg.id.clone();
        store.insert(msg, &["b".into()]);
        let hub = hub_with(store.clone());
        let (b, _rx) = hub.register("b".into(), "C1".into());

        hub.dispatch(&b, ClientCommand::Delivered { message_id: id.clone() }).await;
        assert!(!store.is_pending(&id, &"b".into()));
    }

    // ── redelivery ──

    #[tokio::test]
    async fn reconnect_replays_queued_messages() {
        let store = Arc::new(MemoryMessageStore::new());
        for group in ["G1", "G2", "G1"] {
            store.insert(
                StoredMessage::new(group.into(), "a".into(), json!({ "text": group })),
                &["b".into()],
            );
        }
        let hub = hub_with(store.clone());
        let (_b, mut rx) = hub.register("b".into(), "C1".into());
        hub.join(&"b".into(), &"G1".into(), &"C1".into()).unwrap();
        hub.join(&"b".into(), &"G2".into(), &"C1".into()).unwrap();

        let report = hub.deliver_queued(&"b".into()).await;
        assert_eq!(report.enqueued, 3);
        assert_eq!(report.marked, 3);
        assert_eq!(of_type(&drain(&mut rx), "chat").len(), 3);

        let again = hub.deliver_queued(&"b".into()).await;
        assert_eq!(again.fetched, 0);
    }

    // ── backpressure ──

    #[tokio::test]
    async fn saturated_queue_is_evicted_and_cleaned_once() {
        let hub = hub();
        let _tasks = hub.start();
        let (_a, mut rx_a) = hub.register("a".into(), "C1".into());
        let (b, _rx_b) = hub.register("b".into(), "C1".into());
        hub.join(&"a".into(), &"G1".into(), &"C1".into()).unwrap();
        hub.join(&"b".into(), &"G1".into(), &"C1".into()).unwrap();
        hub.presence().set_typing(&"b".into(), &"G1".into()).unwrap();
        drain(&mut rx_a);

        let event = HubEvent::Chat {
            group_id: "G1".into(),
            sender: "a".into(),
            payload: json!({ "text": "storm" }),
        };
        for _ in 0..256 {
            let fan_out = hub
                .broadcast()
                .send_to_group_except(&"G1".into(), &event, &"a".into())
                .unwrap();
            assert_eq!(fan_out.delivered, 1);
        }
        let overflow = hub
            .broadcast()
            .send_to_group_except(&"G1".into(), &event, &"a".into())
            .unwrap();
        assert_eq!(overflow.dropped, 1);
        assert_eq!(b.drop_count(), 1);

        settle(|| hub.registry().lookup(&"b".into(), &"C1".into()).is_none()).await;
        assert!(b.is_closed());
        assert!(!hub.membership().is_member(&"b".into(), &"G1".into()));
        assert!(!hub.presence().is_typing(&"b".into(), &"G1".into()));

        // the session's own teardown is a no-op
        assert!(!hub.unregister_connection(&b));
        let frames = drain(&mut rx_a);
        assert_eq!(of_type(&frames, "user_left").len(), 1);
        assert_eq!(of_type(&frames, "stop_typing").len(), 1);
        hub.shutdown();
    }

    // ── queries & shutdown ──

    #[tokio::test(start_paused = true)]
    async fn wait_for_client_resolves_on_register() {
        let hub = hub();
        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.wait_for_client(&"C1".into(), Duration::from_secs(5)).await })
        };
        time::sleep(Duration::from_millis(100)).await;
        let _conn = hub.register("a".into(), "C1".into());
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_client_times_out() {
        let hub = hub();
        let _other = hub.register("a".into(), "C2".into());
        assert!(!hub.wait_for_client(&"C1".into(), Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn connected_users_are_listed_per_case() {
        let hub = hub();
        let _b = hub.register("b".into(), "C1".into());
        let _a = hub.register("a".into(), "C1".into());
        let _c = hub.register("c".into(), "C2".into());
        assert_eq!(
            hub.connected_users(&"C1".into()),
            vec![UserId::from("a"), UserId::from("b")]
        );
        assert_eq!(hub.count_clients(&"C2".into()), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_connections_and_stops_tasks() {
        let hub = hub();
        let tasks = hub.start();
        let (a, _rx) = hub.register("a".into(), "C1".into());

        hub.shutdown();
        assert!(hub.is_shutting_down());
        assert!(a.is_closed());
        for task in tasks {
            time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn heartbeat_returns_when_connection_closes() {
        let hub = hub();
        let (a, _rx) = hub.register("a".into(), "C1".into());
        let beat = {
            let hub = hub.clone();
            let a = a.clone();
            tokio::spawn(async move { hub.heartbeat(a).await })
        };
        hub.unregister(&"a".into(), &"C1".into());
        assert_eq!(beat.await.unwrap(), HeartbeatResult::Closed);
    }
}
