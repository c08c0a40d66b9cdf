//! `GET /ws/viewport`: streams [`ViewportEvent`]s as JSON text frames.
//!
//! Registers a fresh sink with the [`Viewport`](crate::viewport::Viewport)
//! bridge for the lifetime of the socket and drains it on a blocking
//! thread, since the sink's queue is a plain
//! [`std::sync::mpsc::Receiver`] that a foreign (non-async) consumer would
//! normally block on.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;

use crate::events::ViewportEvent;

use super::routes::AppState;

pub async fn viewport_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_viewport(socket, state))
}

async fn stream_viewport(mut socket: WebSocket, state: AppState) {
    let Some(mut rx) = state.viewport.register_sink().await else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    loop {
        let (returned, event) = match tokio::task::spawn_blocking(move || {
            let event = rx.recv();
            (rx, event)
        })
        .await
        {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "viewport drain task panicked");
                break;
            }
        };
        rx = returned;

        match event {
            Ok(event) => {
                if !forward_event(&mut socket, &event).await {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

async fn forward_event(socket: &mut WebSocket, event: &ViewportEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize viewport event");
            true
        }
    }
}

