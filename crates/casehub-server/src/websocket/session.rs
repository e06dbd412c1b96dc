//! WebSocket session lifecycle: a single connected client from upgrade
//! through disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use casehub_core::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};
use casehub_core::{CaseId, GroupId, HubEvent, UserId};
use casehub_hub::{ClientConnection, Hub, OutboundFrame};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::handler::handle_text;

/// Identity and routing for one session, resolved before the upgrade.
#[derive(Clone, Debug)]
pub struct SessionParams {
    /// Verified user identity.
    pub user: UserId,
    /// Case from the upgrade path.
    pub case_id: CaseId,
    /// Group joined at handshake.
    pub group_id: GroupId,
    /// Deadline for a single outbound write.
    pub write_timeout: Duration,
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers with the hub (evicting a previous login) and joins the group
/// 2. Spawns the writer, the sole owner of the socket sink
/// 3. Spawns the heartbeat and a background redelivery of queued messages
/// 4. Routes inbound text frames until the socket, the hub or the writer ends
/// 5. Unregisters, which is a no-op if a newer login replaced this one
#[instrument(skip_all, fields(user = %params.user, case_id = %params.case_id))]
pub async fn run_ws_session(ws: WebSocket, params: SessionParams, hub: Arc<Hub>) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (conn, rx) = hub.register(params.user.clone(), params.case_id.clone());

    let started = Instant::now();
    info!(conn_id = %conn.id, group_id = %params.group_id, "client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    if let Err(e) = hub.join(&params.user, &params.group_id, &params.case_id) {
        warn!(group_id = %params.group_id, error = %e, "handshake join rejected");
        let _ = hub.broadcast().send_to_connection(
            &conn,
            &HubEvent::Error {
                group_id: Some(params.group_id.clone()),
                message: e.to_string(),
            },
        );
    }

    let stop = CancellationToken::new();
    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        rx,
        conn.clone(),
        params.write_timeout,
        stop.clone(),
    ));

    let heartbeat = {
        let hub = hub.clone();
        let conn = conn.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            if hub.heartbeat(conn).await.is_dead() {
                stop.cancel();
            }
        })
    };

    {
        let hub = hub.clone();
        let user = params.user.clone();
        let _ = tokio::spawn(async move {
            let _ = hub.deliver_queued(&user).await;
        });
    }

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let msg = match frame {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(error = %e, "websocket read error");
                        break;
                    }
                    None => break,
                };
                conn.mark_alive();
                match msg {
                    Message::Text(text) => handle_text(text.as_str(), &conn, &hub).await,
                    Message::Binary(data) => match std::str::from_utf8(&data) {
                        Ok(text) => handle_text(text, &conn, &hub).await,
                        Err(_) => debug!(len = data.len(), "ignoring non-UTF8 binary frame"),
                    },
                    Message::Close(_) => {
                        info!("client sent close frame");
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => {}
                }
            }
            () = conn.closed() => {
                info!(conn_id = %conn.id, "connection closed by hub");
                break;
            }
            () = stop.cancelled() => break,
        }
    }

    let _ = hub.unregister_connection(&conn);
    stop.cancel();
    heartbeat.abort();
    if timeout(params.write_timeout, &mut writer).await.is_err() {
        debug!("writer did not finish in time, aborting");
        writer.abort();
    }

    info!(conn_id = %conn.id, dropped = conn.drop_count(), "client disconnected");
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

/// Drain the outbound queue into the socket.
///
/// A failed or timed-out write cancels `stop`, which ends the session.
/// When the connection closes a close frame is sent.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundFrame>,
    conn: Arc<ClientConnection>,
    write_timeout: Duration,
    stop: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = conn.closed() => None,
            () = stop.cancelled() => None,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };

        let msg = match frame {
            OutboundFrame::Text(text) => Message::Text(text.as_str().into()),
            OutboundFrame::Ping => Message::Ping(Vec::<u8>::new().into()),
        };
        match timeout(write_timeout, sink.send(msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(conn_id = %conn.id, error = %e, "websocket write failed");
                stop.cancel();
                return;
            }
            Err(_) => {
                warn!(conn_id = %conn.id, timeout = ?write_timeout, "websocket write timed out");
                stop.cancel();
                return;
            }
        }
    }

    let _ = timeout(write_timeout, sink.send(Message::Close(None))).await;
}
