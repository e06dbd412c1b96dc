//! # casehub-server
//!
//! Axum HTTP + `WebSocket` surface for the collaboration hub.
//!
//! - `GET /cases/{case_id}/ws?groupId=`: upgrade into a hub session
//! - `GET /health`: liveness and hub counters
//! - `GET /metrics`: Prometheus text
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::CasehubServer;
