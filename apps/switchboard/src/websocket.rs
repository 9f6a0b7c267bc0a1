use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use switchboard_proto::{ClientEnvelope, ServerEnvelope};

use crate::registry::ConnectionId;
use crate::router::Router;

/// WebSocket upgrade handler for the signaling path.
pub async fn call_handler(ws: WebSocketUpgrade, State(router): State<Arc<Router>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, router))
}

/// One logical actor per connection: envelopes from this socket are
/// processed strictly in arrival order; all shared state lives behind
/// the registry.
async fn handle_socket(socket: WebSocket, router: Arc<Router>) {
    let conn = ConnectionId::new();
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEnvelope>();

    // Writer task drains the connection's outgoing queue. Envelope
    // producers never block or observe delivery failures.
    let writer_conn = conn;
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            match serde_json::to_string(&envelope) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(connection = %writer_conn, error = %err, "failed to encode envelope");
                }
            }
        }
        debug!(connection = %writer_conn, "writer task ended");
    });

    info!(connection = %conn, "signaling connection opened");

    while let Some(frame) = receiver.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(err) => {
                warn!(connection = %conn, error = %err, "websocket error");
                break;
            }
        };
        match msg {
            Message::Text(text) => dispatch_text(&router, conn, &tx, &text),
            // Tolerate JSON envelopes arriving in binary frames.
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => dispatch_text(&router, conn, &tx, &text),
                Err(_) => {
                    debug!(connection = %conn, "non-UTF8 binary frame ignored");
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    router.connection_closed(conn);
    info!(connection = %conn, "signaling connection closed");
}

/// Parse and dispatch one frame. A malformed frame is this connection's
/// problem alone: log and carry on.
fn dispatch_text(
    router: &Router,
    conn: ConnectionId,
    tx: &mpsc::UnboundedSender<ServerEnvelope>,
    text: &str,
) {
    match serde_json::from_str::<ClientEnvelope>(text) {
        Ok(envelope) => router.dispatch(conn, tx, envelope),
        Err(err) => {
            warn!(connection = %conn, error = %err, "malformed envelope ignored");
        }
    }
}
