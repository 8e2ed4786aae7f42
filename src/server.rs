// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Transport server: one port for the REST file API and the `/lsp`
//! WebSocket endpoint.
//!
//! Each accepted WebSocket gets an opaque session id and a
//! [`ProxySession`]; a write task drains the session's outbound channel
//! into the socket while the read loop feeds frames in. Oversized frames
//! are rejected without closing the connection; closing the socket
//! disposes the session.

use anyhow::Result;
use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::HeaderValue,
    response::IntoResponse,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::lsp::AnalyzerManager;
use crate::proxy::ProxySession;
use crate::rest;
use crate::workspace::WorkspaceStore;

/// Shared state handed to every handler.
pub struct AppState {
    /// Loaded configuration.
    pub config: Config,
    /// The workspace file store.
    pub workspace: Arc<WorkspaceStore>,
    /// The analyzer pool.
    pub manager: Arc<AnalyzerManager>,
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

fn next_session_id() -> String {
    format!(
        "{:x}-{:x}",
        std::process::id(),
        NEXT_SESSION.fetch_add(1, Ordering::SeqCst)
    )
}

/// Builds the router: WebSocket upgrade at `/lsp` plus the REST surface,
/// with the configured CORS origin.
pub fn build_router(state: Arc<AppState>) -> Router {
    let origin = state
        .config
        .cors_origin
        .parse::<HeaderValue>()
        .unwrap_or_else(|_| HeaderValue::from_static("http://localhost:3000"));

    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/lsp", get(ws_upgrade))
        .merge(rest::routes())
        .layer(cors)
        .with_state(state)
}

/// Serves the router on `listener` until the future is dropped.
///
/// # Errors
///
/// Returns an error if the accept loop fails.
pub async fn run(state: Arc<AppState>, listener: TcpListener) -> Result<()> {
    let router = build_router(state);
    axum::serve(listener, router).await?;
    Ok(())
}

async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket) {
    let session_id = next_session_id();
    info!("[{session_id}] client connected");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let session = ProxySession::new(
        session_id.clone(),
        state.workspace.clone(),
        state.manager.clone(),
        out_tx,
    );

    let (mut sink, mut stream) = socket.split();

    // Outbound frames drain through one write task; handlers never touch
    // the socket directly.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let limit = state.config.max_frame_bytes;
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if text.len() > limit {
                    session.reject_oversized(&text, limit);
                    continue;
                }
                session.handle_text(&text);
            }
            Ok(Message::Close(_)) => {
                debug!("[{session_id}] close frame");
                break;
            }
            // Ping/pong are answered by the protocol stack; binary frames
            // are not part of the wire contract.
            Ok(_) => {}
            Err(e) => {
                warn!("[{session_id}] websocket error: {e}");
                break;
            }
        }
    }

    session.dispose().await;
    writer.abort();
    info!("[{session_id}] client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let a = next_session_id();
        let b = next_session_id();
        assert_ne!(a, b);
    }
}
