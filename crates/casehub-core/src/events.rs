//! Wire events exchanged over a hub connection.
//!
//! Every frame on the wire is a JSON [`Envelope`]:
//!
//! ```json
//! { "type": "typing", "group_id": "g1", "user_email": "a@x.io",
//!   "payload": { "user_email": "a@x.io", "is_typing": true },
//!   "timestamp": "2025-01-01T00:00:00Z" }
//! ```
//!
//! Outbound traffic is modelled as [`HubEvent`] and converted to an envelope
//! in exactly one place ([`HubEvent::to_envelope`]). Inbound frames are
//! decoded in exactly one place ([`ClientCommand::decode`]); nothing else
//! compares `type` strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::ids::{GroupId, MessageId, UserId};

/// Discriminant of a wire envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A chat message (live or redelivered).
    Chat,
    /// A member started (or is still) typing.
    Typing,
    /// A member stopped typing, explicitly or by TTL expiry.
    StopTyping,
    /// A member joined a group.
    UserJoined,
    /// A member left a group or disconnected.
    UserLeft,
    /// Delivery acknowledgment. Clients historically send `delivered`.
    #[serde(alias = "delivered")]
    MessageDelivered,
    /// Application-level ping.
    Ping,
    /// Application-level pong.
    Pong,
    /// Error notice addressed to one connection.
    Error,
}

impl EventType {
    /// Wire name of this event type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Typing => "typing",
            Self::StopTyping => "stop_typing",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::MessageDelivered => "message_delivered",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error => "error",
        }
    }
}

/// The JSON envelope carried by every text frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event discriminant.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Target or source group (omitted for ping/pong).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<GroupId>,
    /// Sender identity (omitted for ping/pong).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<UserId>,
    /// Opaque, type-dependent payload.
    #[serde(default)]
    pub payload: Value,
    /// RFC 3339 creation time.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Create an envelope of the given type stamped with the current time.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            group_id: None,
            user_email: None,
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Set the group.
    #[must_use]
    pub fn with_group(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    /// Set the sender identity.
    #[must_use]
    pub fn with_user(mut self, user: UserId) -> Self {
        self.user_email = Some(user);
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Outbound event produced by a hub component.
#[derive(Clone, Debug, PartialEq)]
pub enum HubEvent {
    /// Chat message authored by `sender` in `group_id`.
    Chat {
        /// Group the message belongs to.
        group_id: GroupId,
        /// Original author.
        sender: UserId,
        /// Stored message body.
        payload: Value,
    },
    /// `user` is typing in `group_id`.
    Typing {
        /// Group the indicator applies to.
        group_id: GroupId,
        /// Typing member.
        user: UserId,
    },
    /// `user` stopped typing in `group_id`.
    StopTyping {
        /// Group the indicator applies to.
        group_id: GroupId,
        /// Member whose indicator is cleared.
        user: UserId,
    },
    /// `user` joined `group_id`.
    UserJoined {
        /// Joined group.
        group_id: GroupId,
        /// Joining member.
        user: UserId,
    },
    /// `user` left `group_id` (explicitly or by disconnect).
    UserLeft {
        /// Left group.
        group_id: GroupId,
        /// Departing member.
        user: UserId,
    },
    /// `user` acknowledged delivery of `message_id`.
    MessageDelivered {
        /// Group of the acknowledged message.
        group_id: GroupId,
        /// Acknowledging member.
        user: UserId,
        /// Acknowledged message.
        message_id: MessageId,
    },
    /// Reply to a client ping.
    Pong,
    /// Error notice for a single connection.
    Error {
        /// Group the error relates to, if any.
        group_id: Option<GroupId>,
        /// Human-readable description.
        message: String,
    },
}

impl HubEvent {
    /// Wire discriminant of this event.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Chat { .. } => EventType::Chat,
            Self::Typing { .. } => EventType::Typing,
            Self::StopTyping { .. } => EventType::StopTyping,
            Self::UserJoined { .. } => EventType::UserJoined,
            Self::UserLeft { .. } => EventType::UserLeft,
            Self::MessageDelivered { .. } => EventType::MessageDelivered,
            Self::Pong => EventType::Pong,
            Self::Error { .. } => EventType::Error,
        }
    }

    /// Build the wire envelope, stamped with the current time.
    pub fn to_envelope(&self) -> Envelope {
        let envelope = Envelope::new(self.event_type());
        match self {
            Self::Chat {
                group_id,
                sender,
                payload,
            } => envelope
                .with_group(group_id.clone())
                .with_user(sender.clone())
                .with_payload(payload.clone()),
            Self::Typing { group_id, user } => envelope
                .with_group(group_id.clone())
                .with_user(user.clone())
                .with_payload(json!({ "user_email": user, "is_typing": true })),
            Self::StopTyping { group_id, user } => envelope
                .with_group(group_id.clone())
                .with_user(user.clone())
                .with_payload(json!({ "user_email": user, "is_typing": false })),
            Self::UserJoined { group_id, user } | Self::UserLeft { group_id, user } => {
                envelope.with_group(group_id.clone()).with_user(user.clone())
            }
            Self::MessageDelivered {
                group_id,
                user,
                message_id,
            } => envelope
                .with_group(group_id.clone())
                .with_user(user.clone())
                .with_payload(json!({ "message_id": message_id })),
            Self::Pong => envelope,
            Self::Error { group_id, message } => {
                let envelope = envelope.with_payload(json!({ "message": message }));
                match group_id {
                    Some(group_id) => envelope.with_group(group_id.clone()),
                    None => envelope,
                }
            }
        }
    }
}

/// Why an inbound frame could not be turned into a [`ClientCommand`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not valid envelope JSON.
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    /// The `type` field names no known event.
    #[error("unknown event type: {0}")]
    UnknownType(String),
    /// A group-scoped event arrived without `group_id`.
    #[error("{0:?} event requires group_id")]
    MissingGroup(EventType),
    /// A delivery ack arrived without `payload.message_id`.
    #[error("delivery ack requires payload.message_id")]
    MissingMessageId,
    /// The event type is server-originated and not accepted from clients.
    #[error("{0:?} is not a client event")]
    NotClientEvent(EventType),
}

/// Inbound command decoded from a client frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientCommand {
    /// Start or refresh the typing indicator.
    Typing {
        /// Group being typed in.
        group_id: GroupId,
    },
    /// Clear the typing indicator.
    StopTyping {
        /// Group being typed in.
        group_id: GroupId,
    },
    /// Acknowledge delivery of a message.
    Delivered {
        /// Acknowledged message.
        message_id: MessageId,
    },
    /// Application-level ping; answered with a pong.
    Ping,
    /// Application-level pong.
    Pong,
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    group_id: Option<GroupId>,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct DeliveryAck {
    message_id: MessageId,
}

impl ClientCommand {
    /// Decode a text frame. This is the single inbound decode site.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        let event_type: EventType = serde_json::from_value(Value::String(frame.kind.clone()))
            .map_err(|_| DecodeError::UnknownType(frame.kind))?;

        match event_type {
            EventType::Typing => Ok(Self::Typing {
                group_id: frame.group_id.ok_or(DecodeError::MissingGroup(event_type))?,
            }),
            EventType::StopTyping => Ok(Self::StopTyping {
                group_id: frame.group_id.ok_or(DecodeError::MissingGroup(event_type))?,
            }),
            EventType::MessageDelivered => {
                let ack: DeliveryAck = serde_json::from_value(frame.payload)
                    .map_err(|_| DecodeError::MissingMessageId)?;
                Ok(Self::Delivered {
                    message_id: ack.message_id,
                })
            }
            EventType::Ping => Ok(Self::Ping),
            EventType::Pong => Ok(Self::Pong),
            EventType::Chat | EventType::UserJoined | EventType::UserLeft | EventType::Error => {
                Err(DecodeError::NotClientEvent(event_type))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
