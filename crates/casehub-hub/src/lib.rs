//! # casehub-hub
//!
//! The real-time connection and messaging hub behind case-collaboration chat.
//!
//! - [`registry::ConnectionRegistry`]: at most one live connection per (user, case)
//! - [`membership::GroupMembershipIndex`]: group, user and case indices
//! - [`broadcast::BroadcastEngine`]: sole writer to outbound queues, drop-on-full
//! - [`presence::PresenceTracker`]: typing indicators with TTL sweep
//! - [`liveness`]: per-connection heartbeat
//! - [`delivery::DeliveryTracker`]: replay of undelivered messages and acks
//! - [`hub::Hub`]: wires the components together and owns the disconnect cascade
//!
//! The crate is transport-agnostic: a transport session drains the
//! [`connection::OutboundFrame`] receiver returned by [`hub::Hub::register`]
//! and feeds decoded inbound commands to [`hub::Hub::dispatch`].

#![deny(unsafe_code)]

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod errors;
pub mod hub;
pub mod liveness;
pub mod membership;
pub mod presence;
pub mod registry;
pub mod store;

pub use config::HubConfig;
pub use connection::{ClientConnection, OutboundFrame};
pub use errors::{HubError, Result};
pub use hub::Hub;
pub use store::{MemoryMessageStore, MessageStore, StoreError, StoredMessage};
