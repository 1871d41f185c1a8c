//! Record-subscription WebSocket.
//!
//! A client binds once with its session token and then receives a snapshot
//! of every call record it participates in as the record changes. All call
//! mutations go over the HTTP routes; the socket is push-only after bind.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{stream::StreamExt, SinkExt};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{info, warn};

use peal_common::{CallSnapshot, FeedMessage};
use peal_core::CallService;

use crate::auth;

const WS_OUTBOX_CAPACITY: usize = 128;
const WS_MAX_TEXT_BYTES: usize = 64 * 1024;
const WS_BIND_TIMEOUT: Duration = Duration::from_secs(10);

pub type ConnectionMap = Arc<RwLock<HashMap<String, mpsc::Sender<Message>>>>;

fn to_ws_message(message: &FeedMessage) -> Option<Message> {
    serde_json::to_string(message).ok().map(Message::Text)
}

async fn send_message(tx: &mpsc::Sender<Message>, message: &FeedMessage) -> bool {
    let Some(message) = to_ws_message(message) else {
        return false;
    };
    tx.send(message).await.is_ok()
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(connections): State<ConnectionMap>,
    State(pool): State<SqlitePool>,
) -> impl IntoResponse {
    ws.max_message_size(WS_MAX_TEXT_BYTES)
        .max_frame_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, connections, pool))
}

async fn handle_socket(stream: WebSocket, connections: ConnectionMap, pool: SqlitePool) {
    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(WS_OUTBOX_CAPACITY);

    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    let mut bound_user: Option<String> = None;
    let connection_start = Instant::now();

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                break;
            }
            msg = receiver.next() => {
                let Some(msg) = msg else { break; };
                let Ok(msg) = msg else { break; };

                if bound_user.is_none()
                    && Instant::now().duration_since(connection_start) > WS_BIND_TIMEOUT
                {
                    let _ = send_message(&tx, &FeedMessage::Error {
                        message: "Bind timeout".into(),
                    })
                    .await;
                    break;
                }

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        let _ = send_message(&tx, &FeedMessage::Error {
                            message: "Binary messages are not supported".into(),
                        })
                        .await;
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };

                let message: FeedMessage = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("invalid JSON on record feed: {}", err);
                        let _ = send_message(&tx, &FeedMessage::Error {
                            message: "Invalid JSON".into(),
                        })
                        .await;
                        break;
                    }
                };

                match message {
                    FeedMessage::Bind { token } => {
                        if bound_user.is_some() {
                            let _ = send_message(&tx, &FeedMessage::Error {
                                message: "Already bound".into(),
                            })
                            .await;
                            break;
                        }
                        let user = match auth::user_for_token(&pool, &token).await {
                            Ok(Some(user)) => user,
                            Ok(None) => {
                                let _ = send_message(&tx, &FeedMessage::Error {
                                    message: "Invalid token".into(),
                                })
                                .await;
                                break;
                            }
                            Err(err) => {
                                warn!("token lookup failed: {}", err);
                                let _ = send_message(&tx, &FeedMessage::Error {
                                    message: "Token lookup failed".into(),
                                })
                                .await;
                                break;
                            }
                        };

                        let replaced = connections
                            .write()
                            .await
                            .insert(user.as_str().to_string(), tx.clone());
                        if let Some(previous) = replaced {
                            let _ = send_message(&previous, &FeedMessage::Error {
                                message: "Session replaced by a newer connection".into(),
                            })
                            .await;
                        }

                        bound_user = Some(user.as_str().to_string());
                        let _ = send_message(&tx, &FeedMessage::Bound).await;
                        info!("bound record feed for user {}", user);
                    }
                    // The socket is receive-only after bind; mutations go
                    // over the HTTP routes.
                    FeedMessage::Bound | FeedMessage::Call { .. } | FeedMessage::Error { .. } => {
                        let _ = send_message(&tx, &FeedMessage::Error {
                            message: "Unsupported client message type".into(),
                        })
                        .await;
                    }
                }
            }
        }
    }

    if let Some(user) = bound_user {
        info!("record feed disconnected: {}", user);
        connections.write().await.remove(&user);
    }
}

/// Forward every committed record snapshot to its two participants.
pub async fn run_feed_dispatcher(service: Arc<CallService>, connections: ConnectionMap) {
    let mut feed = service.subscribe();
    loop {
        match feed.recv().await {
            Ok(snapshot) => deliver(&connections, &snapshot).await,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "record feed dispatcher lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

pub async fn deliver(connections: &ConnectionMap, snapshot: &CallSnapshot) {
    let message = FeedMessage::Call {
        call: snapshot.clone(),
    };
    let Some(text) = serde_json::to_string(&message).ok() else {
        return;
    };

    let guard = connections.read().await;
    for user in [snapshot.caller_id.as_str(), snapshot.callee_id.as_str()] {
        if let Some(tx) = guard.get(user) {
            if tx.try_send(Message::Text(text.clone())).is_err() {
                warn!(user, "failed to queue record update");
            }
        }
    }
}
