use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::metrics::ServerMetrics;
use crate::session::{ClientChannel, ClientEvent, Emitter, Listener, ServerMessage};

/// Client side of a session backed by a WebSocket connection.
///
/// Outbound messages go through a bounded queue drained by the socket writer;
/// inbound frames are decoded by the reader and fed to [`WsClientChannel::dispatch`].
pub struct WsClientChannel {
    connection_id: String,
    tx: mpsc::Sender<ServerMessage>,
    emitter: Emitter<ClientEvent>,
    metrics: Arc<ServerMetrics>,
}

impl WsClientChannel {
    pub fn new(
        connection_id: String,
        tx: mpsc::Sender<ServerMessage>,
        parked_limit: usize,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            connection_id,
            tx,
            emitter: Emitter::with_parked_limit(parked_limit),
            metrics,
        }
    }

    /// Hand an inbound event to whoever is listening.
    pub fn dispatch(&self, event: ClientEvent) {
        self.emitter.emit(event);
    }
}

impl ClientChannel for WsClientChannel {
    fn send(&self, msg: ServerMessage) {
        match self.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                self.metrics.message_dropped();
                warn!(
                    conn_id = %self.connection_id,
                    "Client send queue full, dropping '{}'",
                    msg.name()
                );
            }
            Err(TrySendError::Closed(msg)) => {
                debug!(
                    conn_id = %self.connection_id,
                    "Client gone, dropping '{}'",
                    msg.name()
                );
            }
        }
    }

    fn add_listener(&self, listener: Listener<ClientEvent>) {
        self.emitter.add_listener(listener);
    }

    fn remove_all_listeners(&self) {
        self.emitter.remove_all_listeners();
    }
}
