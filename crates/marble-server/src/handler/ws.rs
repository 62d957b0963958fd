//! WebSocket connection handling.

use std::fmt;
use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, Stream, StreamExt};
use marble_core::protocol::{ClientMessage, Frame, Framing, ServerMessage};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::common::state::AppState;
use crate::config::CLIENT_WRITER_CAPACITY;
use crate::service::replication::{ClientSlot, SnapshotRequest, SnapshotSource, serve_client};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        let conn_id = Uuid::new_v4();
        handle_socket(socket, state, conn_id).instrument(info_span!("conn", %conn_id))
    })
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Binary(bytes) => Message::Binary(bytes.into()),
        Frame::Text(text) => Message::Text(text.into()),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, conn_id: Uuid) {
    let (mut sink, stream) = socket.split();
    let (writer, mut outgoing) = mpsc::channel::<Frame>(CLIENT_WRITER_CAPACITY);

    let write_task = tokio::spawn(
        async move {
            while let Some(frame) = outgoing.recv().await {
                if let Err(err) = sink.send(to_message(frame)).await {
                    debug!(error = %err, "socket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        }
        .in_current_span(),
    );

    serve_connection(stream, writer, state, conn_id).await;
    let _ = write_task.await;
}

/// Runs one client session over an incoming message stream. Outgoing frames
/// go to `writer`. The client is registered for the lifetime of the call.
async fn serve_connection<S, E>(
    mut stream: S,
    writer: mpsc::Sender<Frame>,
    state: AppState,
    conn_id: Uuid,
) where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    // The handshake goes out as text so any client can read the route table.
    match ServerMessage::Hello(state.simulation.hello()).encode(Framing::Text) {
        Ok(frame) => {
            if writer.send(frame).await.is_err() {
                return;
            }
        }
        Err(err) => warn!(error = %err, "failed to encode hello"),
    }

    let slot = state.clients.register(conn_id);
    let source: Arc<dyn SnapshotSource> = state.simulation.clone();
    let interval = std::time::Duration::from_secs_f64(1.0 / f64::from(state.simulation.tickrate()));
    let responder = tokio::spawn(
        serve_client(slot.clone(), source, writer.clone(), interval).in_current_span(),
    );
    info!(clients = state.clients.len(), "client connected");

    while let Some(incoming) = stream.next().await {
        let frame = match incoming {
            Ok(Message::Binary(bytes)) => Frame::Binary(bytes.to_vec()),
            Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Err(err) => {
                debug!(error = %err, "socket read failed");
                break;
            }
        };

        let Some(reply) = dispatch(&state, &slot, &frame) else {
            continue;
        };
        match reply.encode(frame.framing()) {
            Ok(frame) => {
                if writer.send(frame).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!(error = %err, "failed to encode reply"),
        }
    }

    responder.abort();
    state.clients.unregister(&conn_id);
    info!(skipped = slot.skipped(), answered = slot.answered(), "client disconnected");
}

/// Handles one client frame. Snapshot requests are queued on the slot and
/// answered later by the responder; everything else gets an immediate reply,
/// including an error for frames that fail to decode.
fn dispatch(state: &AppState, slot: &ClientSlot, frame: &Frame) -> Option<ServerMessage> {
    match ClientMessage::decode(frame) {
        Ok(ClientMessage::SnapshotRequest { seq }) => {
            slot.submit(SnapshotRequest {
                seq,
                framing: frame.framing(),
            });
            None
        }
        Ok(ClientMessage::StatusRequest) => Some(ServerMessage::Status(state.simulation.status())),
        Ok(ClientMessage::RosterRequest) => Some(ServerMessage::Roster(state.simulation.roster())),
        Err(err) => {
            debug!(error = %err, "rejected client frame");
            Some(ServerMessage::error(err))
        }
    }
}
