use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures::{stream::StreamExt, SinkExt};
use parley_common::{Invocation, ServerFrame};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{dispatch, ConnectionContext};
use crate::registry::{Outbound, Outbox};
use crate::security::{self, ConnectionPermit, LimitRejection, MessageWindow};
use crate::GatewayState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if !security::ws_origin_allowed(&state.config, origin) {
        warn!("rejected websocket origin {:?} from {}", origin, addr);
        return StatusCode::FORBIDDEN.into_response();
    }

    if !state.upgrade_limiter.allow(addr.ip()) {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let permit = match state.limits.try_acquire(addr.ip()) {
        Ok(permit) => permit,
        Err(LimitRejection::PerIp) => return StatusCode::TOO_MANY_REQUESTS.into_response(),
        Err(LimitRejection::Global) => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
    };

    let max_bytes = state.config.max_frame_bytes;
    ws.max_message_size(max_bytes)
        .max_frame_size(max_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, addr, permit))
        .into_response()
}

async fn handle_socket(
    stream: WebSocket,
    state: GatewayState,
    addr: SocketAddr,
    permit: ConnectionPermit,
) {
    let id = Uuid::new_v4();
    info!("client {} connected from {}", id, addr);

    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(state.config.outbox_capacity);
    let outbox = Outbox::new(tx);
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                Outbound::Text(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    state.registry.insert(id, outbox.clone()).await;
    let _ = outbox
        .send_frame(&ServerFrame::Welcome { connection_id: id })
        .await;

    let mut conn = ConnectionContext::new(id);
    let mut window = MessageWindow::per_minute(state.config.max_messages_per_minute);

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let Ok(msg) = msg else { break; };

                if !window.admit() {
                    let _ = outbox
                        .send_frame(&ServerFrame::Error {
                            message: "Rate limit exceeded".into(),
                        })
                        .await;
                    break;
                }

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        let _ = outbox
                            .send_frame(&ServerFrame::Error {
                                message: "Binary messages are not supported".into(),
                            })
                            .await;
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                let invocation = match Invocation::decode(&text) {
                    Ok(invocation) => invocation,
                    Err(err) => {
                        warn!("invalid invocation from {}: {}", id, err);
                        let _ = outbox
                            .send_frame(&ServerFrame::Error {
                                message: "Invalid invocation".into(),
                            })
                            .await;
                        continue;
                    }
                };

                let invocation_id = invocation.invocation_id;
                let ctx = state.gate.inspect(id, &invocation).await;
                let method = invocation.call.name();
                let fault = dispatch(&state, &mut conn, &ctx, invocation.call).await.err();
                if let Some(fault) = &fault {
                    debug!("{} from {} failed: {}", method, id, fault);
                }

                let completion = ServerFrame::Completion {
                    invocation_id,
                    fault,
                    e2ee_verified: ctx.e2ee_enabled,
                };
                if !outbox.send_frame(&completion).await {
                    break;
                }
            }
        }
    }

    let channels = state.hub.disconnect(id).await;
    let signaling = state.signaling.disconnect(id).await;
    for session_id in conn.registered_sessions.drain() {
        state.sessions.revoke(&session_id).await;
    }
    state.registry.remove(&id).await;
    drop(outbox);
    drop(permit);
    info!(
        "client {} disconnected ({} channels, {} signaling sessions released)",
        id,
        channels.len(),
        signaling
    );
}
