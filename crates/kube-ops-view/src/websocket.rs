//! WebSocket transport for dashboard sessions.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{future, SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ViewError;
use crate::session::ConnectionHandler;
use crate::state::ViewState;
use crate::types::{ClientMessage, ClusterId};

/// Query parameters accepted by /ws.
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    /// Cluster IDs to stream, separated by commas or whitespace.
    pub cluster_ids: Option<String>,
}

impl WsQuery {
    /// Requested clusters; empty when the client wants all of them.
    #[must_use]
    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        self.cluster_ids
            .as_deref()
            .unwrap_or_default()
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|id| !id.is_empty())
            .map(ClusterId::new)
            .collect()
    }
}

/// Handle WebSocket upgrade request for /ws.
pub async fn ws_upgrade(
    State(state): State<Arc<ViewState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ViewError> {
    if state.is_shutting_down() {
        return Err(ViewError::ShuttingDown);
    }

    if !state.add_ws_connection() {
        let current = state.ws_connection_count();
        let max = state.config().max_ws_connections;
        return Err(ViewError::TooManyConnections(current, max));
    }

    let clusters = query.cluster_ids();
    Ok(ws.on_upgrade(move |socket| handle_ws_connection(socket, state, clusters)))
}

/// Encode a message as a text frame.
pub fn encode(message: &ClientMessage) -> Result<Message, ViewError> {
    let json = serde_json::to_string(message)?;
    Ok(Message::Text(json.into()))
}

/// Handle an active WebSocket connection.
async fn handle_ws_connection(socket: WebSocket, state: Arc<ViewState>, clusters: Vec<ClusterId>) {
    let (sender, mut receiver) = socket.split();
    let cancel = state.shutdown_token().child_token();

    let sink = sender
        .sink_map_err(|e| ViewError::WebSocket(e.to_string()))
        .with(|message: Arc<ClientMessage>| future::ready(encode(&message)));

    // Reading only detects closure; client frames carry nothing.
    let reader_cancel = cancel.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => {
                    debug!("Received close frame");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
        reader_cancel.cancel();
    });

    let handler = ConnectionHandler::new(state.registry(), state.hub(), cancel.clone())
        .with_cluster_filter(clusters);
    // Errors are logged by the handler.
    let _ = handler.run(sink).await;

    cancel.cancel();
    recv_task.abort();
    state.remove_ws_connection();
    info!("WebSocket connection closed");
}
