//! WebSocket handler for client connections.

use axum::{
    body::Bytes,
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    http::{HeaderMap, header},
    response::Response,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use kubechat_protocol::OutboundMessage;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::hub::{HubHandle, RemovalReason};
use super::service::{KubeChat, SessionConnection};
use crate::api::{ApiError, AppState};
use crate::error::HubError;

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let config = state.kubechat.config();
    let origin = headers.get(header::ORIGIN).and_then(|h| h.to_str().ok());
    if !config.origin_allowed(origin) {
        warn!("Rejecting WebSocket upgrade from origin {:?}", origin);
        return Err(ApiError::forbidden("Origin not allowed"));
    }

    let limit = config.max_sessions;
    if state.kubechat.session_count().await? >= limit {
        return Err(HubError::CapacityExceeded { limit }.into());
    }

    let max_message_size = config.max_message_size;
    let kubechat = state.kubechat.clone();
    Ok(ws
        .max_message_size(max_message_size)
        .max_frame_size(max_message_size)
        .on_upgrade(move |socket| handle_ws_connection(socket, kubechat)))
}

async fn handle_ws_connection(mut socket: WebSocket, kubechat: KubeChat) {
    let SessionConnection {
        mut session,
        outbound,
        closed,
    } = match kubechat.connect().await {
        Ok(connection) => connection,
        Err(e) => {
            warn!("Refusing WebSocket connection: {}", e);
            let frame = CloseFrame {
                code: close_code::AGAIN,
                reason: e.to_string().into(),
            };
            let _ = socket.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    let session_id = session.id().to_string();
    let config = kubechat.config();
    let read_timeout = config.read_timeout;
    let (sender, mut receiver) = socket.split();

    let writer = tokio::spawn(write_loop(
        sender,
        outbound,
        WriterContext {
            session_id: session_id.clone(),
            closed: closed.clone(),
            hub: kubechat.hub().clone(),
            write_timeout: config.write_timeout,
            ping_period: config.ping_period,
        },
    ));

    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = tokio::time::timeout(read_timeout, receiver.next()) => next,
        };
        match next {
            Ok(Some(Ok(Message::Text(text)))) => session.handle_text(text.as_str()).await,
            Ok(Some(Ok(Message::Pong(_)))) => session.touch().await,
            Ok(Some(Ok(Message::Ping(_)))) => {
                // Answered by axum
                debug!("Session {}: ping", session_id);
            }
            Ok(Some(Ok(Message::Binary(_)))) => {
                debug!("Session {}: ignoring binary frame", session_id);
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                info!("Session {} closed by client", session_id);
                break;
            }
            Ok(Some(Err(e))) => {
                warn!("WebSocket error for session {}: {}", session_id, e);
                break;
            }
            Err(_) => {
                info!(
                    "Session {}: no frames for {:?}, closing",
                    session_id, read_timeout
                );
                break;
            }
        }
    }

    session.close().await;
    let abort = writer.abort_handle();
    if tokio::time::timeout(config.write_timeout, writer)
        .await
        .is_err()
    {
        abort.abort();
    }
    info!("WebSocket connection closed for session {}", session_id);
}

struct WriterContext {
    session_id: String,
    closed: CancellationToken,
    hub: HubHandle,
    write_timeout: Duration,
    ping_period: Duration,
}

/// Drain the outbound queue to the socket, with transport pings in between.
async fn write_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<OutboundMessage>,
    ctx: WriterContext,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ctx.ping_period, ctx.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            biased;
            message = outbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                match message.to_json() {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        warn!("Failed to serialize {} for session {}: {}", message.kind(), ctx.session_id, e);
                        continue;
                    }
                }
            }
            _ = ctx.closed.cancelled() => break,
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        match tokio::time::timeout(ctx.write_timeout, sender.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Session {}: write failed: {}", ctx.session_id, e);
                ctx.hub
                    .request_removal(&ctx.session_id, RemovalReason::Disconnected);
                break;
            }
            Err(_) => {
                warn!(
                    "Session {}: write timed out after {:?}",
                    ctx.session_id, ctx.write_timeout
                );
                ctx.hub
                    .request_removal(&ctx.session_id, RemovalReason::Disconnected);
                break;
            }
        }
    }

    let _ = tokio::time::timeout(ctx.write_timeout, sender.send(Message::Close(None))).await;
}
