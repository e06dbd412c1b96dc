//! Inbound frame handling: decode, then route through the hub.

use std::sync::Arc;

use casehub_core::ClientCommand;
use casehub_core::metrics::WS_MALFORMED_FRAMES_TOTAL;
use casehub_hub::{ClientConnection, Hub};
use metrics::counter;
use tracing::{debug, warn};

/// Handle one inbound text frame.
///
/// Undecodable frames are counted and logged; the connection stays open.
pub async fn handle_text(text: &str, conn: &Arc<ClientConnection>, hub: &Hub) {
    match ClientCommand::decode(text) {
        Ok(command) => {
            debug!(conn_id = %conn.id, ?command, "inbound command");
            hub.dispatch(conn, command).await;
        }
        Err(e) => {
            counter!(WS_MALFORMED_FRAMES_TOTAL).increment(1);
            warn!(conn_id = %conn.id, user = %conn.user, error = %e, "ignoring undecodable frame");
        }
    }
}
