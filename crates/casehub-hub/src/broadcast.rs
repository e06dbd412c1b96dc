//! Broadcast engine, the only writer to connection outbound queues.
//!
//! Every send serializes the event once into a shared `Arc<String>`, takes a
//! single membership snapshot, resolves the recipients' connections, and
//! performs one non-blocking enqueue per recipient. A full or closed queue
//! drops the frame for that recipient and requests its eviction; the
//! overall call still succeeds.

use std::sync::Arc;

use casehub_core::metrics::WS_BROADCAST_DROPS_TOTAL;
use casehub_core::{CaseId, GroupId, HubEvent, UserId};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::ClientConnection;
use crate::errors::{HubError, Result};
use crate::membership::GroupMembershipIndex;
use crate::registry::ConnectionRegistry;

/// Per-call delivery tally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Frames enqueued.
    pub delivered: usize,
    /// Frames dropped on a full or closed queue.
    pub dropped: usize,
}

impl FanOut {
    fn record(&mut self, ok: bool) {
        if ok {
            self.delivered += 1;
        } else {
            self.dropped += 1;
        }
    }

    fn merge(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.dropped += other.dropped;
    }
}

/// Receiving half of the eviction channel, drained by the hub.
pub type EvictionReceiver = mpsc::UnboundedReceiver<Arc<ClientConnection>>;

/// Fans events out to groups, cases, users and single connections.
pub struct BroadcastEngine {
    registry: Arc<ConnectionRegistry>,
    membership: Arc<GroupMembershipIndex>,
    evictions: mpsc::UnboundedSender<Arc<ClientConnection>>,
}

impl BroadcastEngine {
    /// Create an engine plus the receiver of eviction requests.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        membership: Arc<GroupMembershipIndex>,
    ) -> (Self, EvictionReceiver) {
        let (evictions, rx) = mpsc::unbounded_channel();
        (
            Self {
                registry,
                membership,
                evictions,
            },
            rx,
        )
    }

    /// Send `event` to every connected member of `group_id`.
    ///
    /// Returns [`HubError::GroupNotFound`] without side effects if the group
    /// does not exist.
    pub fn send_to_group(&self, group_id: &GroupId, event: &HubEvent) -> Result<FanOut> {
        self.fan_out(group_id, event, None)
    }

    /// Like [`send_to_group`](Self::send_to_group) but skips `except`.
    pub fn send_to_group_except(
        &self,
        group_id: &GroupId,
        event: &HubEvent,
        except: &UserId,
    ) -> Result<FanOut> {
        self.fan_out(group_id, event, Some(except))
    }

    /// Send `event` to every live connection of `user`.
    ///
    /// Returns [`HubError::UserNotConnected`] if the user has none; the
    /// caller decides whether to leave the message for redelivery.
    pub fn send_to_user(&self, user: &UserId, event: &HubEvent) -> Result<FanOut> {
        let connections = self.registry.connections_of(user);
        if connections.is_empty() {
            return Err(HubError::UserNotConnected(user.clone()));
        }
        let frame = encode(event)?;
        let mut tally = FanOut::default();
        for conn in &connections {
            tally.record(self.deliver(conn, &frame));
        }
        Ok(tally)
    }

    /// Send `event` to `user`'s connection in the case that owns `group_id`.
    ///
    /// Returns [`HubError::GroupNotFound`] if the group is not live and
    /// [`HubError::UserNotConnected`] if the user has no connection in that
    /// case. `Ok(false)` means the frame was dropped.
    pub fn send_to_user_in_group(
        &self,
        user: &UserId,
        group_id: &GroupId,
        event: &HubEvent,
    ) -> Result<bool> {
        let case_id = self
            .membership
            .case_of(group_id)
            .ok_or_else(|| HubError::GroupNotFound(group_id.clone()))?;
        let conn = self
            .registry
            .lookup(user, &case_id)
            .ok_or_else(|| HubError::UserNotConnected(user.clone()))?;
        let frame = encode(event)?;
        Ok(self.deliver(&conn, &frame))
    }

    /// Send `event` to every group of `case_id`.
    ///
    /// Returns [`HubError::CaseNotFound`] if the case has no groups. A member
    /// of several groups receives one copy per group.
    pub fn send_to_case(&self, case_id: &CaseId, event: &HubEvent) -> Result<FanOut> {
        let groups = self.membership.groups_of_case(case_id);
        if groups.is_empty() {
            return Err(HubError::CaseNotFound(case_id.clone()));
        }
        let mut tally = FanOut::default();
        for group_id in &groups {
            match self.send_to_group(group_id, event) {
                Ok(part) => tally.merge(part),
                // group emptied between the case lookup and the send
                Err(HubError::GroupNotFound(_)) => {
                    debug!(case_id = %case_id, group_id = %group_id, "group vanished during case broadcast");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(tally)
    }

    /// Enqueue `event` on one connection.
    pub fn send_to_connection(&self, conn: &Arc<ClientConnection>, event: &HubEvent) -> Result<bool> {
        let frame = encode(event)?;
        Ok(self.deliver(conn, &frame))
    }

    /// Enqueue a heartbeat ping. A failure is left to the caller.
    pub fn ping(&self, conn: &ClientConnection) -> bool {
        conn.send_ping()
    }

    fn fan_out(
        &self,
        group_id: &GroupId,
        event: &HubEvent,
        except: Option<&UserId>,
    ) -> Result<FanOut> {
        let snapshot = self
            .membership
            .snapshot(group_id)
            .ok_or_else(|| HubError::GroupNotFound(group_id.clone()))?;
        let frame = encode(event)?;

        let recipients: Vec<UserId> = snapshot
            .members
            .into_iter()
            .filter(|member| Some(member) != except)
            .collect();
        let connections = self.registry.resolve(&snapshot.case_id, &recipients);

        let mut tally = FanOut::default();
        for conn in &connections {
            tally.record(self.deliver(conn, &frame));
        }
        Ok(tally)
    }

    fn deliver(&self, conn: &Arc<ClientConnection>, frame: &Arc<String>) -> bool {
        if conn.send(frame.clone()) {
            return true;
        }
        counter!(WS_BROADCAST_DROPS_TOTAL).increment(1);
        if conn.is_closed() {
            debug!(conn_id = %conn.id, user = %conn.user, "dropping frame for closed connection");
            return false;
        }
        if conn.mark_evicting() {
            warn!(
                conn_id = %conn.id,
                user = %conn.user,
                case_id = %conn.case_id,
                drops = conn.drop_count(),
                "outbound queue full, evicting connection"
            );
            let _ = self.evictions.send(conn.clone());
        }
        false
    }
}

fn encode(event: &HubEvent) -> Result<Arc<String>> {
    Ok(Arc::new(event.to_envelope().to_json()?))
}

#[cfg(test)]
#[allow(unused_results)]
mod tests {
    use super::*;
    use crate::connection::OutboundFrame;
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixture {
        registry: Arc<ConnectionRegistry>,
        membership: Arc<GroupMembershipIndex>,
        engine: BroadcastEngine,
        evictions: EvictionReceiver,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ConnectionRegistry::new());
        let membership = Arc::new(GroupMembershipIndex::new());
        let (engine, evictions) = BroadcastEngine::new(registry.clone(), membership.clone());
        Fixture {
            registry,
            membership,
            engine,
            evictions,
        }
    }

    impl Fixture {
        fn connect(
            &self,
            user: &str,
            case: &str,
            capacity: usize,
        ) -> (Arc<ClientConnection>, mpsc::Receiver<OutboundFrame>) {
            let (conn, rx) = ClientConnection::with_capacity(user.into(), case.into(), capacity);
            self.registry.register(conn.clone());
            (conn, rx)
        }

        fn join(&self, user: &str, group: &str, case: &str) {
            self.membership
                .join(&user.into(), &group.into(), &case.into())
                .unwrap();
        }
    }

    fn typing(group: &str, user: &str) -> HubEvent {
        HubEvent::Typing {
            group_id: group.into(),
            user: user.into(),
        }
    }

    fn next_json(rx: &mut mpsc::Receiver<OutboundFrame>) -> Value {
        match rx.try_recv().unwrap() {
            OutboundFrame::Text(text) => serde_json::from_str(&text).unwrap(),
            OutboundFrame::Ping => panic!("expected text frame"),
        }
    }

    #[tokio::test]
    async fn send_to_group_reaches_every_connected_member() {
        let f = fixture();
        let (_a, mut rx_a) = f.connect("a", "C1", 8);
        let (_b, mut rx_b) = f.connect("b", "C1", 8);
        f.join("a", "G1", "C1");
        f.join("b", "G1", "C1");
        f.join("offline", "G1", "C1");

        let tally = f.engine.send_to_group(&"G1".into(), &typing("G1", "a")).unwrap();
        assert_eq!(tally, FanOut { delivered: 2, dropped: 0 });
        assert_eq!(next_json(&mut rx_a)["type"], "typing");
        assert_eq!(next_json(&mut rx_b)["group_id"], "G1");
    }

    #[tokio::test]
    async fn unknown_group_is_not_found_and_enqueues_nothing() {
        let f = fixture();
        let (_a, mut rx_a) = f.connect("a", "C1", 8);
        f.join("a", "G1", "C1");

        let err = f
            .engine
            .send_to_group(&"nonexistent-group".into(), &typing("x", "a"))
            .unwrap_err();
        assert!(matches!(err, HubError::GroupNotFound(_)));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn group_broadcast_only_uses_connections_of_the_groups_case() {
        let f = fixture();
        let (_a1, mut rx_c1) = f.connect("a", "C1", 8);
        let (_a2, mut rx_c2) = f.connect("a", "C2", 8);
        f.join("a", "G1", "C1");

        f.engine.send_to_group(&"G1".into(), &typing("G1", "b")).unwrap();
        assert!(rx_c1.try_recv().is_ok());
        assert!(rx_c2.try_recv().is_err());
    }

    #[tokio::test]
    async fn except_skips_sender() {
        let f = fixture();
        let (_a, mut rx_a) = f.connect("a", "C1", 8);
        let (_b, mut rx_b) = f.connect("b", "C1", 8);
        f.join("a", "G1", "C1");
        f.join("b", "G1", "C1");

        let tally = f
            .engine
            .send_to_group_except(&"G1".into(), &typing("G1", "a"), &"a".into())
            .unwrap();
        assert_eq!(tally.delivered, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn send_to_user_requires_a_connection() {
        let f = fixture();
        let err = f.engine.send_to_user(&"ghost".into(), &HubEvent::Pong).unwrap_err();
        assert!(matches!(err, HubError::UserNotConnected(_)));

        let (_a, mut rx) = f.connect("a", "C1", 8);
        let tally = f.engine.send_to_user(&"a".into(), &HubEvent::Pong).unwrap();
        assert_eq!(tally.delivered, 1);
        assert_eq!(next_json(&mut rx)["type"], "pong");
    }

    #[tokio::test]
    async fn send_to_case_delegates_per_group() {
        let f = fixture();
        let (_a, mut rx_a) = f.connect("a", "C1", 8);
        let (_b, mut rx_b) = f.connect("b", "C1", 8);
        f.join("a", "G1", "C1");
        f.join("b", "G2", "C1");

        let tally = f.engine.send_to_case(&"C1".into(), &HubEvent::Pong).unwrap();
        assert_eq!(tally.delivered, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());

        let err = f.engine.send_to_case(&"C9".into(), &HubEvent::Pong).unwrap_err();
        assert!(matches!(err, HubError::CaseNotFound(_)));
    }

    #[tokio::test]
    async fn full_queue_drops_once_and_requests_eviction_once() {
        let mut f = fixture();
        let (slow, _rx_slow) = f.connect("slow", "C1", 2);
        let (_fast, mut rx_fast) = f.connect("fast", "C1", 16);
        f.join("slow", "G1", "C1");
        f.join("fast", "G1", "C1");

        for _ in 0..4 {
            let tally = f.engine.send_to_group(&"G1".into(), &HubEvent::Pong).unwrap();
            assert!(tally.delivered >= 1);
        }

        assert_eq!(slow.drop_count(), 2);
        let evicted = f.evictions.try_recv().unwrap();
        assert_eq!(evicted.id, slow.id);
        assert!(f.evictions.try_recv().is_err());

        let mut fast_frames = 0;
        while rx_fast.try_recv().is_ok() {
            fast_frames += 1;
        }
        assert_eq!(fast_frames, 4);
    }

    #[tokio::test]
    async fn closed_connection_is_not_evicted_again() {
        let mut f = fixture();
        let (a, _rx) = f.connect("a", "C1", 4);
        f.join("a", "G1", "C1");
        f.registry.unregister(&"a".into(), &"C1".into());

        let tally = f.engine.send_to_connection(&a, &HubEvent::Pong).unwrap();
        assert!(!tally);
        assert!(f.evictions.try_recv().is_err());
    }

    #[tokio::test]
    async fn ping_enqueues_ping_frame() {
        let f = fixture();
        let (a, mut rx) = f.connect("a", "C1", 4);
        assert!(f.engine.ping(&a));
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Ping);
    }

    #[tokio::test]
    async fn broadcast_serializes_once() {
        let f = fixture();
        let (_a, mut rx_a) = f.connect("a", "C1", 4);
        let (_b, mut rx_b) = f.connect("b", "C1", 4);
        f.join("a", "G1", "C1");
        f.join("b", "G1", "C1");
        f.engine.send_to_group(&"G1".into(), &HubEvent::Pong).unwrap();

        let (OutboundFrame::Text(x), OutboundFrame::Text(y)) =
            (rx_a.try_recv().unwrap(), rx_b.try_recv().unwrap())
        else {
            panic!("expected text frames");
        };
        assert!(Arc::ptr_eq(&x, &y));
    }

    #[tokio::test]
    async fn user_in_group_routes_by_the_group_case() {
        let f = fixture();
        let (_c1, mut rx_c1) = f.connect("a", "C1", 4);
        f.join("a", "G1", "C1");
        f.join("b", "G2", "C2");

        let err = f
            .engine
            .send_to_user_in_group(&"a".into(), &"G2".into(), &HubEvent::Pong)
            .unwrap_err();
        assert!(matches!(err, HubError::UserNotConnected(_)));
        assert!(rx_c1.try_recv().is_err());

        let (_c2, mut rx_c2) = f.connect("a", "C2", 4);
        assert!(
            f.engine
                .send_to_user_in_group(&"a".into(), &"G2".into(), &HubEvent::Pong)
                .unwrap()
        );
        assert_eq!(next_json(&mut rx_c2)["type"], "pong");
        assert!(rx_c1.try_recv().is_err());
    }

    #[tokio::test]
    async fn user_in_unknown_group_is_not_found() {
        let f = fixture();
        let (_a, mut rx) = f.connect("a", "C1", 4);
        let err = f
            .engine
            .send_to_user_in_group(&"a".into(), &"G9".into(), &HubEvent::Pong)
            .unwrap_err();
        assert!(matches!(err, HubError::GroupNotFound(_)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn membership_churn_never_duplicates_within_one_send() {
        const SENDS: usize = 200;
        const MEMBERS: [&str; 6] = ["anchor", "m1", "m2", "m3", "m4", "m5"];

        let f = fixture();
        let mut receivers = Vec::new();
        for member in MEMBERS {
            let (_conn, rx) = f.connect(member, "C1", SENDS + 8);
            receivers.push((member, rx));
        }
        f.join("anchor", "G1", "C1");

        let stop = Arc::new(AtomicBool::new(false));
        let churn = {
            let membership = f.membership.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                let (group, case) = (GroupId::from("G1"), CaseId::from("C1"));
                while !stop.load(Ordering::Relaxed) {
                    for member in &MEMBERS[1..] {
                        let user = UserId::from(*member);
                        let _ = membership.join(&user, &group, &case);
                        tokio::task::yield_now().await;
                        membership.leave(&user, &group);
                    }
                }
            })
        };

        let mut delivered = 0;
        for seq in 0..SENDS {
            let event = HubEvent::Chat {
                group_id: "G1".into(),
                sender: "anchor".into(),
                payload: json!({ "seq": seq }),
            };
            let fan_out = f.engine.send_to_group(&"G1".into(), &event).unwrap();
            assert_eq!(fan_out.dropped, 0);
            delivered += fan_out.delivered;
            tokio::task::yield_now().await;
        }
        stop.store(true, Ordering::Relaxed);
        churn.await.unwrap();

        let mut received = 0;
        for (member, rx) in &mut receivers {
            let mut seen = HashSet::new();
            while let Ok(frame) = rx.try_recv() {
                let OutboundFrame::Text(text) = frame else {
                    continue;
                };
                let value: Value = serde_json::from_str(&text).unwrap();
                let seq = value["payload"]["seq"].as_u64().unwrap();
                assert!(seen.insert(seq), "{member} received seq {seq} twice");
                received += 1;
            }
            if *member == "anchor" {
                assert_eq!(seen.len(), SENDS);
            }
        }
        assert_eq!(received, delivered);
    }
}
