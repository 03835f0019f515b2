use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::Message},
    response::IntoResponse,
    routing::get,
};
use peerdrop_core::{
    ClientMessage, ErrorInfo, IncomingOffer, MAX_SIGNAL_MESSAGE_BYTES, PeerId, PeerInfo,
    ServerMessage, decode_client, encode_server, validate_display_name,
};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
struct Connection {
    peer: PeerInfo,
    tx: mpsc::UnboundedSender<Message>,
}

/// The session registry: every connected peer, keyed by its relay-assigned
/// id. Join/Leave/Rename/Relay are its only mutation surface.
#[derive(Debug, Default)]
struct Registry {
    peers: HashMap<PeerId, Connection>,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<Registry>>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Registry::default())),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_frame_size(MAX_SIGNAL_MESSAGE_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("socket session ended with error: {}", err);
            }
        })
}

async fn handle_socket(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Keepalive interval for the per-client write half.  When using split
    // WebSocket streams, Pong responses to incoming Pings are queued by the
    // read half but only flushed when the write half actually sends data.
    // Without periodic writes, a reverse proxy (e.g. Caddy) may consider
    // the relay-side connection idle/dead and close it.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let first_message = ws_receiver
        .next()
        .await
        .ok_or_else(|| "client disconnected before name announcement".to_owned())
        .and_then(|result| result.map_err(|err| err.to_string()))?;

    let display_name = parse_name_message(&first_message)?;
    let peer_id = new_peer_id();

    register_peer(
        &state,
        Connection {
            peer: PeerInfo {
                id: peer_id.clone(),
                display_name: display_name.clone(),
            },
            tx: outbound_tx.clone(),
        },
    )
    .await;

    info!("peer {} joined as \"{}\"", peer_id, display_name);

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!("websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                if text.len() > MAX_SIGNAL_MESSAGE_BYTES {
                    warn!("dropping oversized message from {}", peer_id);
                    send_error(&outbound_tx, "message exceeds size limit");
                    continue;
                }

                let client_message = match decode_client(text.as_str()) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!("failed to decode message from {}: {}", peer_id, err);
                        send_error(&outbound_tx, "malformed message");
                        continue;
                    }
                };

                match client_message {
                    ClientMessage::Name(announcement) => {
                        if let Err(err) = validate_display_name(&announcement.display_name) {
                            warn!("rename rejected for {}: {}", peer_id, err);
                            send_error(&outbound_tx, &err.to_string());
                            continue;
                        }
                        rename_peer(&state, &peer_id, announcement.display_name).await;
                    }
                    other => relay_message(&state, &peer_id, &outbound_tx, other).await,
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    unregister_peer(&state, &peer_id).await;
    send_task.abort();
    info!("peer {} left", peer_id);
    Ok(())
}

fn parse_name_message(message: &Message) -> Result<String, String> {
    let text = match message {
        Message::Text(text) => text,
        _ => return Err("first message must be a text name announcement".to_owned()),
    };

    let decoded =
        decode_client(text.as_str()).map_err(|err| format!("invalid first message: {}", err))?;
    match decoded {
        ClientMessage::Name(announcement) => {
            validate_display_name(&announcement.display_name).map_err(|err| err.to_string())?;
            Ok(announcement.display_name)
        }
        _ => Err("first message must be a name announcement".to_owned()),
    }
}

fn new_peer_id() -> PeerId {
    let value: u128 = rand::rng().random();
    format!("{value:032x}")
}

async fn register_peer(state: &AppState, connection: Connection) {
    let mut registry = state.inner.write().await;
    registry
        .peers
        .insert(connection.peer.id.clone(), connection);
    let recipients = roster_recipients(&registry);
    drop(registry);

    broadcast_roster(recipients);
}

async fn rename_peer(state: &AppState, peer_id: &PeerId, display_name: String) {
    let mut registry = state.inner.write().await;
    if let Some(connection) = registry.peers.get_mut(peer_id) {
        connection.peer.display_name = display_name;
    }
    let recipients = roster_recipients(&registry);
    drop(registry);

    broadcast_roster(recipients);
}

async fn unregister_peer(state: &AppState, peer_id: &PeerId) {
    let mut registry = state.inner.write().await;
    registry.peers.remove(peer_id);
    let recipients = roster_recipients(&registry);
    drop(registry);

    broadcast_roster(recipients);
}

/// Per-recipient roster views, computed under the lock but delivered after
/// it is released. Each peer's copy excludes that peer itself.
fn roster_recipients(
    registry: &Registry,
) -> Vec<(mpsc::UnboundedSender<Message>, Vec<PeerInfo>)> {
    registry
        .peers
        .values()
        .map(|connection| {
            let roster = registry
                .peers
                .values()
                .filter(|other| other.peer.id != connection.peer.id)
                .map(|other| other.peer.clone())
                .collect::<Vec<_>>();
            (connection.tx.clone(), roster)
        })
        .collect()
}

fn broadcast_roster(recipients: Vec<(mpsc::UnboundedSender<Message>, Vec<PeerInfo>)>) {
    for (tx, roster) in recipients {
        send_message(&tx, &ServerMessage::Users(roster));
    }
}

/// Forwards one signaling message to its target peer, rewriting
/// `remote_peer_id` to the sender's id so the recipient always sees who it
/// came from. An unknown target is reported back to the sender, never
/// silently dropped.
async fn relay_message(
    state: &AppState,
    sender_id: &PeerId,
    sender_tx: &mpsc::UnboundedSender<Message>,
    message: ClientMessage,
) {
    let Some(target_id) = message.remote_peer_id().cloned() else {
        return;
    };

    let (target_tx, sender_name) = {
        let registry = state.inner.read().await;
        let sender_name = registry
            .peers
            .get(sender_id)
            .map(|connection| connection.peer.display_name.clone())
            .unwrap_or_default();
        let target_tx = registry
            .peers
            .get(&target_id)
            .map(|connection| connection.tx.clone());
        (target_tx, sender_name)
    };

    let Some(target_tx) = target_tx else {
        warn!(
            "{} addressed unknown peer {}",
            sender_id, target_id
        );
        send_error(sender_tx, &format!("unknown peer {}", target_id));
        return;
    };

    let forwarded = rewrite_for_target(message, sender_id, sender_name);
    send_message(&target_tx, &forwarded);
}

fn rewrite_for_target(
    message: ClientMessage,
    sender_id: &PeerId,
    sender_name: String,
) -> ServerMessage {
    match message {
        ClientMessage::Send(mut request) => ServerMessage::ConfirmReceive(IncomingOffer {
            remote_peer_id: sender_id.clone(),
            remote_name: sender_name,
            file_name: std::mem::take(&mut request.file_name),
            file_size: request.file_size,
            mime_type: std::mem::take(&mut request.mime_type),
        }),
        ClientMessage::Receive(mut reply) => {
            reply.remote_peer_id = sender_id.clone();
            ServerMessage::ConfirmSend(reply)
        }
        ClientMessage::Desc(mut payload) => {
            payload.remote_peer_id = sender_id.clone();
            ServerMessage::Desc(payload)
        }
        ClientMessage::Candidate(mut payload) => {
            payload.remote_peer_id = sender_id.clone();
            ServerMessage::Candidate(payload)
        }
        ClientMessage::ReceiveState(mut status) => {
            status.remote_peer_id = sender_id.clone();
            ServerMessage::ReceiveState(status)
        }
        ClientMessage::Abort(mut payload) => {
            payload.remote_peer_id = sender_id.clone();
            ServerMessage::Abort(payload)
        }
        // Name has no target and is handled before relaying.
        ClientMessage::Name(_) => ServerMessage::Error(ErrorInfo {
            reason: "name announcements are not relayed".to_owned(),
        }),
    }
}

fn send_error(tx: &mpsc::UnboundedSender<Message>, reason: &str) {
    send_message(
        tx,
        &ServerMessage::Error(ErrorInfo {
            reason: reason.to_owned(),
        }),
    );
}

fn send_message(tx: &mpsc::UnboundedSender<Message>, message: &ServerMessage) {
    let text = match encode_server(message) {
        Ok(text) => text,
        Err(err) => {
            error!("failed to serialize server message: {}", err);
            return;
        }
    };

    let _ = tx.send(Message::Text(text.into()));
}
