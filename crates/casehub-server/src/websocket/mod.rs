//! WebSocket sessions: one reader loop, one writer task and one heartbeat
//! per connection.

pub mod handler;
pub mod session;
