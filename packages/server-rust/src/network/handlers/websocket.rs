//! Sync sessions over websockets.
//!
//! The connect request is dispatched before the upgrade. A session then runs
//! two halves: a writer task draining the connection's outbound channel and
//! the read loop below, which decodes upstream frames and forwards them to
//! the view syncer that owns the client group.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use viewsync_core::messages::{decode, encode, Downstream, Encoding, ErrorKind, Upstream};

use super::AppState;
use crate::dispatcher::Route;
use crate::error::SyncError;
use crate::network::{ConnectionMetadata, OutboundMessage};

/// Serializes `message` as a frame of the given encoding: JSON travels as
/// text frames, `MsgPack` as binary frames.
///
/// # Errors
///
/// The message cannot be encoded.
pub fn encode_frame(message: &Downstream, encoding: Encoding) -> anyhow::Result<Message> {
    let bytes = encode(message, encoding)?;
    Ok(match encoding {
        Encoding::Json => Message::Text(String::from_utf8(bytes)?.into()),
        Encoding::MsgPack => Message::Binary(bytes.into()),
    })
}

/// Decodes an upstream frame. `None` for control frames.
fn decode_frame(frame: &Message) -> Option<(Result<Upstream, SyncError>, Encoding)> {
    match frame {
        Message::Text(text) => Some((
            decode(text.as_str().as_bytes(), Encoding::Json).map_err(SyncError::from),
            Encoding::Json,
        )),
        Message::Binary(bytes) => Some((
            decode(bytes, Encoding::MsgPack).map_err(SyncError::from),
            Encoding::MsgPack,
        )),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) => None,
    }
}

/// Handles every path the router does not know: connect requests of the
/// form `[/{tenant}]/api/sync/v{N}/connect`.
pub async fn ws_handler(
    State(state): State<AppState>,
    uri: Uri,
    Query(query): Query<HashMap<String, String>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let route = state.dispatcher.dispatch(uri.path(), &query);
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            return match route {
                Err(e) => (
                    StatusCode::NOT_FOUND,
                    Json(Downstream::error(e.kind(), e.to_string())),
                )
                    .into_response(),
                Ok(_) => rejection.into_response(),
            };
        }
    };
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let connection = &state.config.connection;
    let ws = ws
        .max_message_size(connection.max_message_size)
        .write_buffer_size(connection.write_buffer_size)
        .max_write_buffer_size(connection.max_write_buffer_size);
    match route {
        Ok(route) => ws.on_upgrade(move |socket| run_session(socket, state, route)),
        Err(e) => {
            debug!(path = %uri.path(), error = %e, "connect request rejected");
            ws.on_upgrade(move |socket| reject(socket, e))
        }
    }
}

/// Tells the client why its connect request failed and closes.
async fn reject(mut socket: WebSocket, error: SyncError) {
    let message = Downstream::error(error.kind(), error.to_string());
    if let Ok(frame) = encode_frame(&message, Encoding::Json) {
        let _ = socket.send(frame).await;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: error.kind().as_str().into(),
        })))
        .await;
}

async fn run_session(socket: WebSocket, state: AppState, route: Route) {
    let _session = state.shutdown.session_guard();
    let Route {
        tenant,
        params,
        syncer,
        ..
    } = route;
    let client_id = params.client_id.clone();
    let group_id = params.client_group_id.clone();
    let (handle, mut outbound) = state.registry.register(
        &state.config.connection,
        ConnectionMetadata {
            client_id: client_id.clone(),
            client_group_id: group_id.clone(),
            wsid: params.wsid.clone(),
            ..ConnectionMetadata::default()
        },
    );
    let conn = handle.id;
    let (mut sink, mut stream) = socket.split();

    let metadata = Arc::clone(&handle.metadata);
    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            match message {
                OutboundMessage::Message(message) => {
                    let encoding = metadata.read().await.encoding;
                    let frame = match encode_frame(&message, encoding) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(error = %e, "dropping unencodable message");
                            continue;
                        }
                    };
                    if sink.send(frame).await.is_err() {
                        break;
                    }
                }
                OutboundMessage::Close(reason) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.unwrap_or_default().into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    info!(%conn, %tenant, client_group = %group_id, client = %client_id, "sync session opened");
    if syncer.connect(params, Arc::clone(&handle)).await.is_ok() {
        let idle_timeout = state.config.connection.idle_timeout;
        let mut shutdown = state.shutdown.shutdown_receiver();
        loop {
            tokio::select! {
                frame = tokio::time::timeout(idle_timeout, stream.next()) => {
                    let frame = match frame {
                        Ok(Some(Ok(frame))) => frame,
                        Ok(Some(Err(e))) => {
                            debug!(%conn, error = %e, "websocket read failed");
                            break;
                        }
                        Ok(None) => break,
                        Err(_) => {
                            debug!(%conn, "idle timeout");
                            handle.close("idle timeout");
                            break;
                        }
                    };
                    if matches!(frame, Message::Close(_)) {
                        break;
                    }
                    let Some((decoded, encoding)) = decode_frame(&frame) else {
                        continue;
                    };
                    {
                        let mut meta = handle.metadata.write().await;
                        meta.encoding = encoding;
                        meta.last_message = Instant::now();
                    }
                    let message = match decoded {
                        Ok(message) => message,
                        Err(e) => {
                            let _ = handle.send(Downstream::error(ErrorKind::InvalidMessage, e.to_string()));
                            handle.close("invalid message");
                            break;
                        }
                    };
                    if syncer.message(&group_id, &client_id, conn, message).await.is_err() {
                        handle.close("view syncer stopped");
                        break;
                    }
                }
                () = handle.evicted.notified() => {
                    debug!(%conn, "evicted");
                    break;
                }
                _ = shutdown.changed() => {
                    handle.close("server shutting down");
                    break;
                }
            }
        }
        syncer.disconnect(&group_id, &client_id, conn).await;
    }

    state.registry.remove(conn);
    let send_timeout = state.config.connection.send_timeout;
    let _ = handle
        .send_timeout(OutboundMessage::Close(None), send_timeout)
        .await;
    let lifetime = handle.connected_at.elapsed();
    drop(handle);
    if tokio::time::timeout(send_timeout, &mut writer).await.is_err() {
        writer.abort();
    }
    info!(
        %conn,
        client_group = %group_id,
        client = %client_id,
        secs = lifetime.as_secs(),
        "sync session closed"
    );
}
