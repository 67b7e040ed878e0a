//! Backend Channel
//!
//! The pub/sub link between a session and the worker executing the user's
//! computation. A channel is addressed by session code: until one is set it
//! can neither publish nor receive.

mod hub;

pub use hub::{BackendHub, BackendMessage, HubBackendChannel, UpstreamMessage, WorkerEndpoint};

use serde_json::Value;

use crate::session::Listener;

/// Events a backend channel emits towards the session.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    /// Worker output to relay downstream.
    Data { name: String, data: Value },
    /// The backend session ended.
    Destroy { reason: String },
}

pub trait BackendChannel: Send {
    /// Send downstream-originated data to the worker.
    fn data_d(&mut self, name: &str, data: Value);

    /// Associate (or with `None`, disassociate) the channel with a session code.
    fn set_sess_code(&mut self, sess_code: Option<String>);

    fn sess_code(&self) -> Option<&str>;

    /// Start listening on the transport.
    fn subscribe(&mut self);

    fn unsubscribe(&mut self);

    fn add_listener(&mut self, listener: Listener<BackendEvent>);

    fn remove_all_listeners(&mut self);
}
