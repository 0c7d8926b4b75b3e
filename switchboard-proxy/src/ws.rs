//! The `/ws` event channel.
//!
//! Bidirectional: the first client message must be
//! `{"action": "subscribe", "orgId"?, "events"?}`; from then on the
//! server pushes `{type, payload, timestamp}` envelopes matching the
//! subscription. A later subscribe message replaces the filter. Closing
//! the socket unregisters the subscriber.

use std::collections::HashSet;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use tracing::{debug, warn};

use switchboard_core::events::EventType;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct ClientMessage {
    action: String,
    #[serde(rename = "orgId")]
    org_id: Option<String>,
    events: Option<Vec<EventType>>,
}

pub async fn ws_handler(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // Wait for the initial subscribe.
    let subscribe = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => match parse_subscribe(&text) {
                Some(message) => break message,
                None => {
                    warn!("Ignoring malformed event-channel message");
                }
            },
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(error = %e, "Event channel socket error before subscribe");
                return;
            }
        }
    };

    let (mut subscriber_id, mut rx) = state
        .fanout
        .subscribe(subscribe.org_id.clone(), interests_of(&subscribe));
    debug!(subscriber = %subscriber_id, "Event channel subscribed");

    loop {
        tokio::select! {
            event = rx.recv() => {
                let envelope = match event {
                    Some(envelope) => envelope,
                    None => break,
                };
                let payload = match serde_json::to_string(&envelope) {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Event serialisation failed");
                        continue;
                    }
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        // A fresh subscribe replaces the current filter.
                        if let Some(message) = parse_subscribe(&text) {
                            state.fanout.unsubscribe(subscriber_id);
                            let (new_id, new_rx) = state
                                .fanout
                                .subscribe(message.org_id.clone(), interests_of(&message));
                            subscriber_id = new_id;
                            rx = new_rx;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "Event channel socket error");
                        break;
                    }
                }
            }
        }
    }

    state.fanout.unsubscribe(subscriber_id);
    debug!("Event channel closed");
}

fn parse_subscribe(text: &str) -> Option<ClientMessage> {
    let message: ClientMessage = serde_json::from_str(text).ok()?;
    (message.action == "subscribe").then_some(message)
}

fn interests_of(message: &ClientMessage) -> Option<HashSet<EventType>> {
    message
        .events
        .as_ref()
        .map(|events| events.iter().copied().collect())
}
