//! Server metrics for observability
//!
//! Provides runtime counters for connections, sessions and message routing.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently active WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Session metrics
    /// Sessions whose startup join completed
    pub sessions_started: AtomicU64,
    /// Sessions torn down because the client went away
    pub client_teardowns: AtomicU64,
    /// Sessions torn down because the backend went away
    pub backend_teardowns: AtomicU64,

    // Routing metrics
    pub routed_to_workspace: AtomicU64,
    pub routed_to_backend: AtomicU64,
    pub control_messages: AtomicU64,
    /// Messages discarded (pre-init, no workspace, stale workspace)
    pub messages_dropped: AtomicU64,

    // Error metrics
    /// Failed profile or bucket store calls
    pub store_errors: AtomicU64,
    pub websocket_errors: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Session tracking
    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_teardown(&self) {
        self.client_teardowns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn backend_teardown(&self) {
        self.backend_teardowns.fetch_add(1, Ordering::Relaxed);
    }

    // Routing
    pub fn routed_to_workspace(&self) {
        self.routed_to_workspace.fetch_add(1, Ordering::Relaxed);
    }

    pub fn routed_to_backend(&self) {
        self.routed_to_backend.fetch_add(1, Ordering::Relaxed);
    }

    pub fn control_message(&self) {
        self.control_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    pub fn store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_error(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            sessions: SessionMetrics {
                started: self.sessions_started.load(Ordering::Relaxed),
                client_teardowns: self.client_teardowns.load(Ordering::Relaxed),
                backend_teardowns: self.backend_teardowns.load(Ordering::Relaxed),
            },
            routing: RoutingMetrics {
                workspace: self.routed_to_workspace.load(Ordering::Relaxed),
                backend: self.routed_to_backend.load(Ordering::Relaxed),
                control: self.control_messages.load(Ordering::Relaxed),
                dropped: self.messages_dropped.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                store: self.store_errors.load(Ordering::Relaxed),
                websocket: self.websocket_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub sessions: SessionMetrics,
    pub routing: RoutingMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub started: u64,
    pub client_teardowns: u64,
    pub backend_teardowns: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMetrics {
    pub workspace: u64,
    pub backend: u64,
    pub control: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub store: u64,
    pub websocket: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub connections: u64,
    /// Backend topics currently held open by the hub
    pub backend_topics: u64,
    pub uptime_secs: u64,
}
