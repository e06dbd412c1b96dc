//! # casehub-store
//!
//! SQLite implementation of the hub's [`MessageStore`](casehub_hub::MessageStore)
//! collaborator contract.
//!
//! - [`connection`]: `r2d2` pool with WAL and foreign-key pragmas
//! - [`migrations`]: embedded schema migrations tracked in `schema_version`
//! - [`repository`]: stateless SQL over a borrowed `Connection`
//! - [`store::SqliteMessageStore`]: async adapter that runs the repository on
//!   the blocking pool

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod migrations;
pub mod repository;
pub mod store;

pub use errors::{Result, SqliteStoreError};
pub use store::SqliteMessageStore;
