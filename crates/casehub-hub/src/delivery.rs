//! Redelivery of queued messages and delivery acknowledgments.
//!
//! On (re)connect the tracker pages through the user's undelivered messages,
//! pushes each to the user's connection in the case that owns the message's
//! group, and reports the enqueued ones back to the store, batched per group.
//! Messages with no live group or no connection in that case stay pending.
//! Store failures are logged and never propagate into the connection
//! handshake.

use std::collections::BTreeMap;
use std::sync::Arc;

use casehub_core::metrics::{REDELIVERED_MESSAGES_TOTAL, STORE_ERRORS_TOTAL};
use casehub_core::{GroupId, HubEvent, MessageId, UserId};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastEngine;
use crate::config::HubConfig;
use crate::errors::HubError;
use crate::store::{MessageStore, StoreError, StoredMessage};

/// Outcome of one redelivery cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedeliveryReport {
    /// Messages read from the store.
    pub fetched: usize,
    /// Messages enqueued on the user's connection.
    pub enqueued: usize,
    /// Messages left pending because their case has no connection.
    pub skipped: usize,
    /// Messages successfully marked delivered.
    pub marked: usize,
    /// Per-group mark calls that failed.
    pub mark_failures: usize,
}

/// Replays undelivered messages and forwards acks to the store.
pub struct DeliveryTracker {
    store: Arc<dyn MessageStore>,
    broadcast: Arc<BroadcastEngine>,
    batch_size: usize,
    max_messages: usize,
}

impl DeliveryTracker {
    /// Create a tracker paging `batch_size` messages at a time.
    pub fn new(
        store: Arc<dyn MessageStore>,
        broadcast: Arc<BroadcastEngine>,
        config: &HubConfig,
    ) -> Self {
        Self {
            store,
            broadcast,
            batch_size: config.redelivery_batch_size.max(1),
            max_messages: config.redelivery_max_messages,
        }
    }

    /// Push every queued message for `user` and mark the enqueued ones.
    ///
    /// A failed fetch aborts this cycle only; the next reconnect retries.
    pub async fn deliver_queued(&self, user: &UserId) -> RedeliveryReport {
        let mut report = RedeliveryReport::default();
        let mut batches: BTreeMap<GroupId, Vec<MessageId>> = BTreeMap::new();
        let mut cursor: Option<MessageId> = None;

        'pages: while report.fetched < self.max_messages {
            let limit = self.batch_size.min(self.max_messages - report.fetched);
            let page = match self
                .store
                .get_undelivered_messages(user, limit, cursor.as_ref())
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    counter!(STORE_ERRORS_TOTAL, "op" => "get_undelivered").increment(1);
                    warn!(user = %user, error = %e, "failed to fetch undelivered messages, redelivery aborted");
                    break;
                }
            };

            let short_page = page.len() < limit;
            report.fetched += page.len();

            for message in page {
                cursor = Some(message.id.clone());
                match self.push(user, &message) {
                    Push::Enqueued => {
                        report.enqueued += 1;
                        batches.entry(message.group_id).or_default().push(message.id);
                    }
                    Push::Unroutable => report.skipped += 1,
                    Push::Dropped => {
                        debug!(user = %user, message_id = %message.id, "redelivery stopped, outbound queue full");
                        break 'pages;
                    }
                }
            }

            if short_page {
                break;
            }
        }

        for (group_id, ids) in &batches {
            match self
                .store
                .mark_messages_as_delivered(group_id, ids, user)
                .await
            {
                Ok(()) => report.marked += ids.len(),
                Err(e) => {
                    report.mark_failures += 1;
                    counter!(STORE_ERRORS_TOTAL, "op" => "mark_delivered").increment(1);
                    warn!(user = %user, group_id = %group_id, count = ids.len(), error = %e, "failed to mark messages delivered");
                }
            }
        }

        if report.enqueued > 0 {
            counter!(REDELIVERED_MESSAGES_TOTAL).increment(report.enqueued as u64);
            info!(
                user = %user,
                enqueued = report.enqueued,
                groups = batches.len(),
                "redelivered queued messages"
            );
        }
        report
    }

    /// Record `user`'s acknowledgment of `message_id`.
    ///
    /// The message's group is resolved through the store. Remaining group
    /// members are told about the ack when the group is live.
    pub async fn ack_delivered(&self, message_id: &MessageId, user: &UserId) -> Result<(), StoreError> {
        let message = self.store.get_message_by_id(message_id).await?;
        self.store
            .mark_messages_as_delivered(&message.group_id, std::slice::from_ref(message_id), user)
            .await?;

        let event = HubEvent::MessageDelivered {
            group_id: message.group_id.clone(),
            user: user.clone(),
            message_id: message_id.clone(),
        };
        if let Err(e) = self.broadcast.send_to_group_except(&message.group_id, &event, user)
            && !e.is_not_found()
        {
            warn!(group_id = %message.group_id, error = %e, "failed to announce delivery");
        }
        Ok(())
    }

    fn push(&self, user: &UserId, message: &StoredMessage) -> Push {
        let event = HubEvent::Chat {
            group_id: message.group_id.clone(),
            sender: message.sender.clone(),
            payload: message.to_payload(),
        };
        match self
            .broadcast
            .send_to_user_in_group(user, &message.group_id, &event)
        {
            Ok(true) => Push::Enqueued,
            Ok(false) => Push::Dropped,
            Err(HubError::GroupNotFound(_) | HubError::UserNotConnected(_)) => Push::Unroutable,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "failed to encode queued message");
                Push::Unroutable
            }
        }
    }
}

/// Outcome of pushing one queued message.
enum Push {
    Enqueued,
    /// No live group, or no connection in the group's case.
    Unroutable,
    /// The queue was full or closed; the connection is being evicted.
    Dropped,
}
