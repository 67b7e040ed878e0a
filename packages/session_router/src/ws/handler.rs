//! WebSocket Handler
//!
//! One socket per session: a writer task drains the client queue onto the
//! socket, the reader decodes frames into client events, and the session
//! itself runs on its own task.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppState;
use super::client::WsClientChannel;
use crate::backend::HubBackendChannel;
use crate::session::{ClientEvent, Envelope, ServerMessage, spawn_session};

/// How long a disconnected session gets to finish its teardown.
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

fn decode_frame(text: &str) -> Result<ClientEvent, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(text)?;
    ClientEvent::from_envelope(envelope)
}

/// Handle one client connection for its whole lifetime.
pub async fn handle_session_ws(socket: WebSocket, state: AppState, user_id: Option<String>) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(
        conn_id = %connection_id,
        "New session connection (user: {})",
        user_id.as_deref().unwrap_or("anonymous")
    );
    state.metrics.connection_opened();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let config = &state.services.config;
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(config.client_buffer);
    let client = Arc::new(WsClientChannel::new(
        connection_id.clone(),
        tx,
        config.parked_event_limit,
        state.metrics.clone(),
    ));
    let backend = Box::new(HubBackendChannel::new(state.backend_hub.clone()));

    // Writer: runs until every handle on the client queue is gone, so
    // messages queued during teardown still reach the socket.
    let writer_metrics = state.metrics.clone();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg.to_envelope()) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                writer_metrics.websocket_error();
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut session = spawn_session(client.clone(), backend, user_id, state.services.clone());

    let reader_client = client.clone();
    let reader_metrics = state.metrics.clone();
    let reader_conn = connection_id.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match decode_frame(&text) {
                    Ok(event) => reader_client.dispatch(event),
                    Err(e) => debug!(conn_id = %reader_conn, "Ignoring malformed frame: {}", e),
                },
                Ok(Message::Close(_)) => {
                    debug!("Client closed connection");
                    break;
                }
                Err(e) => {
                    reader_metrics.websocket_error();
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }
    };

    let finished = tokio::select! {
        _ = input_task => {
            debug!("Input task ended");
            None
        }
        outcome = &mut session => {
            debug!("Session ended before the client");
            Some(outcome)
        }
    };

    let outcome = match finished {
        Some(outcome) => outcome,
        None => {
            client.dispatch(ClientEvent::Disconnect);
            match tokio::time::timeout(TEARDOWN_GRACE, &mut session).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(conn_id = %connection_id, "Session did not finish teardown in time");
                    session.abort();
                    state.metrics.connection_closed();
                    return;
                }
            }
        }
    };

    match outcome {
        Ok(outcome) => info!(
            conn_id = %connection_id,
            session = %outcome.session_id,
            sess_code = ?outcome.sess_code,
            teardown = ?outcome.teardown,
            "Session connection closed"
        ),
        Err(e) => error!(conn_id = %connection_id, "Session task failed: {}", e),
    }
    state.metrics.connection_closed();
}
