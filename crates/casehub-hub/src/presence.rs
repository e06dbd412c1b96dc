//! Typing presence with TTL expiry.
//!
//! Each (group, user) entry moves Idle → Typing → Idle (explicit clear) or
//! Expired (sweep). Map mutation happens under the write lock; the resulting
//! `typing`/`stop_typing` broadcasts go out after the lock is released and
//! always exclude the typing user.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use casehub_core::metrics::TYPING_EXPIRED_TOTAL;
use casehub_core::{GroupId, HubEvent, UserId};
use metrics::counter;
use parking_lot::RwLock;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broadcast::BroadcastEngine;
use crate::errors::{HubError, Result};

type TypingKey = (GroupId, UserId);

/// Tracks who is typing where.
pub struct PresenceTracker {
    typing: RwLock<HashMap<TypingKey, Instant>>,
    broadcast: Arc<BroadcastEngine>,
    ttl: Duration,
}

impl PresenceTracker {
    /// Create a tracker whose entries expire after `ttl`.
    pub fn new(broadcast: Arc<BroadcastEngine>, ttl: Duration) -> Self {
        Self {
            typing: RwLock::new(HashMap::new()),
            broadcast,
            ttl,
        }
    }

    /// Record or refresh that `user` is typing in `group_id` and tell the
    /// rest of the group.
    ///
    /// Returns [`HubError::GroupNotFound`] (recording nothing) for an
    /// unknown group.
    pub fn set_typing(&self, user: &UserId, group_id: &GroupId) -> Result<()> {
        let event = HubEvent::Typing {
            group_id: group_id.clone(),
            user: user.clone(),
        };
        // Validate and fan out before recording so an unknown group leaves no entry.
        let _ = self.broadcast.send_to_group_except(group_id, &event, user)?;
        let _ = self
            .typing
            .write()
            .insert((group_id.clone(), user.clone()), Instant::now());
        Ok(())
    }

    /// Clear `user`'s indicator in `group_id`.
    ///
    /// Broadcasts `stop_typing` only if an entry existed, so a late explicit
    /// clear after expiry does not notify twice. Returns whether an entry
    /// was removed.
    pub fn clear_typing(&self, user: &UserId, group_id: &GroupId) -> bool {
        let removed = self
            .typing
            .write()
            .remove(&(group_id.clone(), user.clone()))
            .is_some();
        if removed {
            self.notify_stopped(group_id, user);
        }
        removed
    }

    /// Clear `user`'s indicators in every group of `groups`.
    pub fn clear_user(&self, user: &UserId, groups: &[GroupId]) -> usize {
        groups
            .iter()
            .filter(|group_id| self.clear_typing(user, group_id))
            .count()
    }

    /// Remove every entry at least `ttl` old and broadcast a synthetic
    /// `stop_typing` for each. Returns the expired (group, user) pairs.
    pub fn sweep_expired(&self) -> Vec<(GroupId, UserId)> {
        let now = Instant::now();
        let expired: Vec<TypingKey> = {
            let mut typing = self.typing.write();
            let stale: Vec<TypingKey> = typing
                .iter()
                .filter(|(_, since)| now.saturating_duration_since(**since) >= self.ttl)
                .map(|(key, _)| key.clone())
                .collect();
            for key in &stale {
                let _ = typing.remove(key);
            }
            stale
        };

        for (group_id, user) in &expired {
            counter!(TYPING_EXPIRED_TOTAL).increment(1);
            debug!(group_id = %group_id, user = %user, "typing indicator expired");
            self.notify_stopped(group_id, user);
        }
        expired
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until
    /// `cancel` fires.
    pub async fn run_sweep(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let _ = self.sweep_expired();
                }
                () = cancel.cancelled() => {
                    info!("typing sweep stopped");
                    return;
                }
            }
        }
    }

    /// Whether `user` currently has an indicator in `group_id`.
    pub fn is_typing(&self, user: &UserId, group_id: &GroupId) -> bool {
        self.typing
            .read()
            .contains_key(&(group_id.clone(), user.clone()))
    }

    /// Users typing in `group_id`, sorted.
    pub fn typing_in(&self, group_id: &GroupId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .typing
            .read()
            .keys()
            .filter(|(g, _)| g == group_id)
            .map(|(_, u)| u.clone())
            .collect();
        users.sort();
        users
    }

    /// Number of live indicators.
    pub fn len(&self) -> usize {
        self.typing.read().len()
    }

    /// Whether no indicator is live.
    pub fn is_empty(&self) -> bool {
        self.typing.read().is_empty()
    }

    fn notify_stopped(&self, group_id: &GroupId, user: &UserId) {
        let event = HubEvent::StopTyping {
            group_id: group_id.clone(),
            user: user.clone(),
        };
        match self.broadcast.send_to_group_except(group_id, &event, user) {
            Ok(_) => {}
            // the group emptied out; nobody is left to tell
            Err(HubError::GroupNotFound(_)) => {}
            Err(e) => debug!(group_id = %group_id, error = %e, "stop_typing broadcast failed"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
