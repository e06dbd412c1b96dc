//! # casehub-core
//!
//! Foundation types shared by every casehub crate:
//!
//! - [`ids`]: branded identifier newtypes (`UserId`, `CaseId`, `GroupId`, ...)
//! - [`events`]: the JSON wire envelope plus tagged inbound/outbound event enums
//! - [`logging`]: `tracing` subscriber initialization
//! - [`metrics`]: metric name constants used across crates

#![deny(unsafe_code)]

pub mod events;
pub mod ids;
pub mod logging;
pub mod metrics;

pub use events::{ClientCommand, DecodeError, Envelope, EventType, HubEvent};
pub use ids::{CaseId, ConnectionId, GroupId, MessageId, UserId};
