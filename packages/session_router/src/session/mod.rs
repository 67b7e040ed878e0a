//! Session Multiplexer
//!
//! One multiplexer per client connection. It owns the backend channel and the
//! active workspace, and relays traffic between them and the client:
//! - waits for the profile lookup and the client's `init` before routing
//! - routes client messages by name (control, workspace, backend)
//! - keeps exactly one set of listeners bound to each channel
//! - tears the other channels down once any side terminates

mod emitter;
pub(crate) mod handlers;
mod multiplexer;
pub mod protocol;
pub mod routing;
mod startup;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use emitter::{DEFAULT_PARKED_LIMIT, Emitter, Listener};
pub use multiplexer::{SessionMultiplexer, SessionOutcome, SessionServices, Teardown, spawn_session};
pub use protocol::{ClientEvent, Envelope, InitAction, InitRequest, ServerMessage};
pub use routing::{ControlAction, Route, RoutingTable};
pub use startup::{JoinOutcome, StartupJoin};

/// The end-user side of a session.
///
/// Shared between the multiplexer and the tasks it spawns for side effects,
/// so all methods take `&self`.
pub trait ClientChannel: Send + Sync {
    fn send(&self, msg: ServerMessage);

    fn add_listener(&self, listener: Listener<ClientEvent>);

    fn remove_all_listeners(&self);
}
