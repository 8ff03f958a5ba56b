use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::api::{Owner, SharedState};
use crate::pipeline::{EventSender, OwnedEvent};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Upgrade to a socket that streams the caller's own pipeline events.
pub async fn ws_handler(
    Owner(owner): Owner,
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let tx = state.pipeline.events().clone();
    ws.on_upgrade(move |socket| handle_socket(socket, tx, owner))
}

async fn handle_socket(socket: WebSocket, tx: EventSender, owner: String) {
    let (sender, receiver) = socket.split();
    let rx = tx.subscribe();
    tracing::debug!(owner = %owner, subscribers = tx.receiver_count(), "Event stream connected");
    run_socket_loop(sender, receiver, rx, &owner).await;
    tracing::debug!(owner = %owner, "Event stream closed");
}

/// Next event addressed to `owner`. Other owners' events are skipped;
/// `None` once the channel is closed.
async fn next_event_for(rx: &mut broadcast::Receiver<OwnedEvent>, owner: &str) -> Option<String> {
    loop {
        match rx.recv().await {
            Ok(event) if event.owner == owner => return Some(event.payload),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event stream client lagged");
            }
        }
    }
}

/// Forward the owner's events to the client until it goes away.
///
/// A Ping goes out every [`PING_INTERVAL`]; if no Pong has arrived within
/// [`PONG_TIMEOUT`] of the last one, the connection is dropped.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<OwnedEvent>,
    owner: &str,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // First tick is immediate.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::debug!("Event stream client stopped answering pings");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            event = next_event_for(&mut rx, owner) => {
                let Some(payload) = event else { break };
                if sender.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
