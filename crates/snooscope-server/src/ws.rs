//! Live event stream.
//!
//! Each connection gets its own bounded subscription on the bus; a
//! client that stops reading loses its own frames and cannot slow the
//! scrapers or other clients down.

use crate::routes::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use snooscope_core::{EventKind, Subscription};

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    /// Comma-separated event types; unknown names are ignored, absent
    /// means everything.
    pub types: Option<String>,
}

pub async fn handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let kinds = query.types.as_deref().and_then(|raw| {
        let kinds: Vec<EventKind> = raw.split(',').filter_map(EventKind::parse).collect();
        (!kinds.is_empty()).then_some(kinds)
    });
    let subscription = state.bus.subscribe(kinds);
    ws.on_upgrade(move |socket| stream_events(socket, subscription))
}

async fn stream_events(socket: WebSocket, mut subscription: Subscription) {
    let (mut sender, mut receiver) = socket.split();
    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let frame = match serde_json::to_string(&event) {
                    Ok(frame) => frame,
                    Err(err) => {
                        tracing::warn!(%err, "unserializable event frame");
                        continue;
                    }
                };
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // pings are answered by axum; other frames are noise
                    _ => {}
                }
            }
        }
    }
    tracing::debug!(
        subscriber = subscription.id(),
        dropped = subscription.dropped(),
        "event stream closed"
    );
}
