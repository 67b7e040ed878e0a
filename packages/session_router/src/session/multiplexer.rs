//! The per-connection session.
//!
//! Every channel callback is turned into a [`SessionInput`] on one inbox, and
//! a single task drains it. Binding, routing and teardown therefore never race
//! each other, and listener bookkeeping stays a plain `&mut self` affair.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handlers::{self, HandlerContext};
use super::protocol::{ClientEvent, InitAction, InitRequest, ServerMessage};
use super::routing::{BUCKET_REPO_CREATED, ControlAction, Route, RoutingTable};
use super::startup::{JoinOutcome, StartupJoin};
use super::{ClientChannel, Listener};
use crate::backend::{BackendChannel, BackendEvent};
use crate::config::SessionConfig;
use crate::metrics::ServerMetrics;
use crate::models::{BucketRecord, UserProfile};
use crate::store::{BucketStore, ProfileStore, StoreError};
use crate::tokens::random_token;
use crate::workspace::{Workspace, WorkspaceEvent, WorkspaceFactory, WorkspaceKind, WorkspaceVariant};

const CLIENT_DISCONNECT: &str = "Client Disconnect";
const UNKNOWN_BUCKET: &str = "Unknown Bucket";
const SHARING_ENABLED: &str = "Sharing Enabled";
const SHARING_DISABLED: &str = "Sharing Disabled";

/// Collaborators shared by every session on the server.
#[derive(Clone)]
pub struct SessionServices {
    pub profiles: Arc<dyn ProfileStore>,
    pub buckets: Arc<dyn BucketStore>,
    pub workspaces: Arc<dyn WorkspaceFactory>,
    pub config: SessionConfig,
    pub metrics: Arc<ServerMetrics>,
}

/// Everything that can happen to a session, in arrival order.
#[derive(Debug)]
pub(crate) enum SessionInput {
    Client(ClientEvent),
    Backend(BackendEvent),
    /// Tagged with the generation of the workspace that emitted it.
    Workspace { generation: u64, event: WorkspaceEvent },
    ProfileLoaded(Option<UserProfile>),
    BucketLoaded {
        bucket_id: String,
        result: Result<Option<BucketRecord>, StoreError>,
    },
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    Client,
    Backend { reason: String },
}

/// Final state of a session, returned when its task finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub session_id: String,
    pub user_id: Option<String>,
    pub sess_code: Option<String>,
    /// Workspace held at teardown, if any.
    pub workspace: Option<WorkspaceKind>,
    pub teardown: Option<Teardown>,
}

pub struct SessionMultiplexer {
    id: String,
    sess_code: Option<String>,
    user: Option<UserProfile>,
    bucket_id: Option<String>,
    skip_create: bool,
    destroyed: bool,
    teardown: Option<Teardown>,

    client: Arc<dyn ClientChannel>,
    backend: Box<dyn BackendChannel>,
    workspace: Option<Box<dyn Workspace>>,
    /// Bumped on every workspace swap; events from older workspaces are dropped.
    workspace_generation: u64,

    services: SessionServices,
    handlers: HandlerContext,
    routing: RoutingTable,
    startup: StartupJoin,

    inbox_tx: mpsc::UnboundedSender<SessionInput>,
    inbox_rx: mpsc::UnboundedReceiver<SessionInput>,
}

/// Create a session for a freshly accepted client and run it on its own task.
pub fn spawn_session(
    client: Arc<dyn ClientChannel>,
    backend: Box<dyn BackendChannel>,
    user_id: Option<String>,
    services: SessionServices,
) -> JoinHandle<SessionOutcome> {
    let mut session = SessionMultiplexer::new(client, backend, services);
    session.start(user_id);
    tokio::spawn(session.run())
}

impl SessionMultiplexer {
    pub fn new(
        client: Arc<dyn ClientChannel>,
        backend: Box<dyn BackendChannel>,
        services: SessionServices,
    ) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let handlers = HandlerContext {
            session_id: id.clone(),
            client: client.clone(),
            profiles: services.profiles.clone(),
            buckets: services.buckets.clone(),
            metrics: services.metrics.clone(),
            min_password_length: services.config.min_password_length,
            closed: CancellationToken::new(),
        };
        Self {
            id,
            sess_code: None,
            user: None,
            bucket_id: None,
            skip_create: false,
            destroyed: false,
            teardown: None,
            client,
            backend,
            workspace: None,
            workspace_generation: 0,
            services,
            handlers,
            routing: RoutingTable::new(),
            startup: StartupJoin::new(),
            inbox_tx,
            inbox_rx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn sess_code(&self) -> Option<&str> {
        self.sess_code.as_deref()
    }

    pub fn user(&self) -> Option<&UserProfile> {
        self.user.as_ref()
    }

    pub fn workspace_kind(&self) -> Option<WorkspaceKind> {
        self.workspace.as_ref().map(|ws| ws.kind())
    }

    /// Announce readiness, start listening to the client and look up the
    /// caller's profile. Routing waits until both the lookup and the client's
    /// `init` have arrived.
    pub fn start(&mut self, user_id: Option<String>) {
        info!(session = %self.id, "created (user: {:?})", user_id);
        self.client.send(ServerMessage::Init);
        self.client.add_listener(self.client_listener());

        let profiles = self.services.profiles.clone();
        let metrics = self.services.metrics.clone();
        let tx = self.inbox_tx.clone();
        let session_id = self.id.clone();
        tokio::spawn(async move {
            let profile = match user_id {
                None => None,
                Some(id) => match profiles.find_by_id(&id).await {
                    Ok(Some(profile)) => Some(profile),
                    Ok(None) => {
                        warn!(session = %session_id, "no profile for user {}", id);
                        None
                    }
                    Err(e) => {
                        metrics.store_error();
                        error!(session = %session_id, "profile lookup failed: {}", e);
                        None
                    }
                },
            };
            let _ = tx.send(SessionInput::ProfileLoaded(profile));
        });
    }

    /// Drain the inbox until the session is destroyed.
    pub async fn run(mut self) -> SessionOutcome {
        while !self.destroyed {
            let Some(input) = self.inbox_rx.recv().await else {
                break;
            };
            self.handle(input);
        }
        info!(session = %self.id, "ended ({:?})", self.teardown);
        self.outcome()
    }

    pub fn outcome(&self) -> SessionOutcome {
        SessionOutcome {
            session_id: self.id.clone(),
            user_id: self.user.as_ref().map(|u| u.id.clone()),
            sess_code: self.sess_code.clone(),
            workspace: self.workspace_kind(),
            teardown: self.teardown.clone(),
        }
    }

    pub(crate) fn handle(&mut self, input: SessionInput) {
        if self.destroyed {
            debug!(session = %self.id, "ignoring input after teardown");
            return;
        }
        match input {
            SessionInput::Client(ClientEvent::Init(init)) => self.on_init(init),
            SessionInput::Client(ClientEvent::Message { name, data }) => {
                if self.startup.has_fired() {
                    self.route(name, data);
                } else {
                    self.services.metrics.message_dropped();
                    debug!(session = %self.id, "dropping '{}' received before init", name);
                }
            }
            SessionInput::Client(ClientEvent::Disconnect) => self.on_client_disconnect(),
            SessionInput::Backend(event) => self.on_backend_event(event),
            SessionInput::Workspace { generation, event } => {
                if generation == self.workspace_generation && self.workspace.is_some() {
                    self.on_workspace_event(event);
                } else {
                    debug!(session = %self.id, "dropping event from replaced workspace");
                }
            }
            SessionInput::ProfileLoaded(profile) => {
                if let Some(outcome) = self.startup.offer_profile(profile, self.destroyed) {
                    self.on_joined(outcome);
                }
            }
            SessionInput::BucketLoaded { bucket_id, result } => {
                self.on_bucket_loaded(bucket_id, result)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Listener binding
    // -------------------------------------------------------------------------

    fn client_listener(&self) -> Listener<ClientEvent> {
        let tx = self.inbox_tx.clone();
        Listener::new(move |event| {
            let _ = tx.send(SessionInput::Client(event));
        })
    }

    fn backend_listener(&self) -> Listener<BackendEvent> {
        let tx = self.inbox_tx.clone();
        Listener::new(move |event| {
            let _ = tx.send(SessionInput::Backend(event));
        })
    }

    fn workspace_listener(&self) -> Listener<WorkspaceEvent> {
        let tx = self.inbox_tx.clone();
        let generation = self.workspace_generation;
        Listener::new(move |event| {
            let _ = tx.send(SessionInput::Workspace { generation, event });
        })
    }

    /// Attach exactly one listener set to the current channels. Always starts
    /// from a clean slate, so calling it repeatedly is harmless.
    fn bind(&mut self) {
        self.unbind();

        self.client.add_listener(self.client_listener());
        let backend_listener = self.backend_listener();
        self.backend.add_listener(backend_listener);
        let workspace_listener = self.workspace_listener();
        if let Some(ws) = self.workspace.as_mut() {
            ws.add_listener(workspace_listener);
            ws.subscribe();
        }
        self.backend.subscribe();
    }

    /// Detach every listener this session installed. Safe on unbound channels.
    fn unbind(&mut self) {
        self.client.remove_all_listeners();
        self.backend.remove_all_listeners();
        self.backend.unsubscribe();
        if let Some(ws) = self.workspace.as_mut() {
            ws.remove_all_listeners();
            ws.unsubscribe();
        }
    }

    /// Swap the workspace, destroying the old one, and rebind.
    fn replace_workspace(&mut self, next: Option<Box<dyn Workspace>>, reason: &str) {
        self.unbind();
        if let Some(mut old) = self.workspace.take() {
            debug!(session = %self.id, "retiring {} workspace: {}", old.kind(), reason);
            old.destroy_d(reason);
        }
        self.workspace = next;
        self.workspace_generation += 1;
        self.bind();
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    fn on_init(&mut self, init: InitRequest) {
        if self.startup.has_fired() {
            debug!(session = %self.id, "ignoring repeated init");
            return;
        }
        if let Some(outcome) = self.startup.offer_init(init, self.destroyed) {
            self.on_joined(outcome);
        }
    }

    fn on_joined(&mut self, JoinOutcome { profile, init }: JoinOutcome) {
        self.services.metrics.session_started();
        self.user = profile;
        self.skip_create = init.skip_create;

        if let Some(user) = self.user.as_ref() {
            handlers::announce_profile(&self.handlers, user);
        }

        let variant = WorkspaceVariant::select(&init, self.user.as_ref());
        info!(
            session = %self.id,
            "joined as {} workspace (user: {:?})",
            variant.kind(),
            self.user.as_ref().map(|u| u.id.as_str())
        );
        if let WorkspaceVariant::Bucket { bucket_id, .. } = &variant {
            self.bucket_id = Some(bucket_id.clone());
        }

        let workspace = self.services.workspaces.create(variant);
        self.replace_workspace(Some(workspace), "Replaced");

        if init.action == InitAction::Bucket {
            if let Some(bucket_id) = self.bucket_id.clone() {
                self.spawn_bucket_load(bucket_id);
            }
        } else if !self.skip_create {
            self.begin_request();
        }
    }

    fn begin_request(&mut self) {
        if let Some(ws) = self.workspace.as_mut() {
            ws.begin_octave_request();
        }
    }

    fn spawn_bucket_load(&self, bucket_id: String) {
        let buckets = self.services.buckets.clone();
        let tx = self.inbox_tx.clone();
        tokio::spawn(async move {
            let result = buckets.find_by_id(&bucket_id).await;
            let _ = tx.send(SessionInput::BucketLoaded { bucket_id, result });
        });
    }

    fn on_bucket_loaded(
        &mut self,
        bucket_id: String,
        result: Result<Option<BucketRecord>, StoreError>,
    ) {
        if self.bucket_id.as_deref() != Some(bucket_id.as_str()) {
            debug!(session = %self.id, "ignoring stale bucket lookup {}", bucket_id);
            return;
        }
        match result {
            Ok(Some(bucket)) => {
                self.client.send(ServerMessage::BucketInfo { bucket });
                if !self.skip_create {
                    self.begin_request();
                }
            }
            Ok(None) => {
                warn!(session = %self.id, "unknown bucket {}", bucket_id);
                self.client
                    .send(ServerMessage::alert(format!("Unknown bucket: {}", bucket_id)));
                self.client.send(ServerMessage::DestroyU {
                    reason: UNKNOWN_BUCKET.to_string(),
                });
                self.replace_workspace(None, UNKNOWN_BUCKET);
            }
            Err(e) => {
                self.services.metrics.store_error();
                error!(session = %self.id, "bucket lookup failed: {}", e);
                self.client
                    .send(ServerMessage::alert(format!("Could not load bucket: {}", e)));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Routing
    // -------------------------------------------------------------------------

    fn route(&mut self, name: String, data: Value) {
        match self.routing.classify(&name) {
            Route::Control(action) => {
                self.services.metrics.control_message();
                self.on_control(action, data);
            }
            Route::Workspace => match self.workspace.as_mut() {
                Some(ws) => {
                    self.services.metrics.routed_to_workspace();
                    ws.data_d(&name, data);
                }
                None => {
                    self.services.metrics.message_dropped();
                    debug!(session = %self.id, "no workspace for '{}'", name);
                }
            },
            Route::WorkspaceAndBackend => {
                if let Some(ws) = self.workspace.as_mut() {
                    self.services.metrics.routed_to_workspace();
                    ws.data_d(&name, data.clone());
                }
                self.services.metrics.routed_to_backend();
                self.backend.data_d(&name, data);
            }
            Route::Backend => {
                self.services.metrics.routed_to_backend();
                self.backend.data_d(&name, data);
            }
        }
    }

    fn on_control(&mut self, action: ControlAction, data: Value) {
        match action {
            ControlAction::Init => debug!(session = %self.id, "ignoring repeated init"),
            ControlAction::Ping => handlers::ping(&self.handlers, &data),
            ControlAction::Enroll => handlers::enroll(&self.handlers, self.user.as_mut(), &data),
            ControlAction::UnenrollStudent => {
                handlers::unenroll_student(&self.handlers, self.user.as_ref(), &data)
            }
            ControlAction::ReenrollStudent => {
                handlers::reenroll_student(&self.handlers, self.user.as_ref(), &data)
            }
            ControlAction::SetPassword => {
                handlers::set_password(&self.handlers, self.user.as_ref(), &data)
            }
            ControlAction::ToggleSharing => self.toggle_sharing(&data),
            ControlAction::DeleteBucket => {
                handlers::delete_bucket(&self.handlers, self.user.as_ref(), &data)
            }
        }
    }

    fn toggle_sharing(&mut self, data: &Value) {
        let Some(enabled) = data.get("enabled").and_then(Value::as_bool) else {
            debug!(session = %self.id, "toggle_sharing without 'enabled'");
            return;
        };
        let Some(user) = self.user.as_mut() else {
            debug!(session = %self.id, "toggle_sharing without a signed-in user");
            return;
        };

        if enabled {
            if user.share_key.is_none() {
                user.share_key = Some(random_token(self.services.config.share_key_length));
            }
            let snapshot = user.clone();
            info!(session = %self.id, "sharing enabled for {}", snapshot.id);

            let host = self.services.workspaces.create(WorkspaceVariant::Host {
                user: snapshot.clone(),
            });
            self.replace_workspace(Some(host), SHARING_ENABLED);
            // The shared document only exists once the host has subscribed.
            if let (Some(code), Some(ws)) = (self.sess_code.clone(), self.workspace.as_mut()) {
                ws.set_sess_code(&code);
            }
            handlers::persist_sharing(&self.handlers, snapshot);
        } else {
            if !user.in_default_program() {
                warn!(
                    session = %self.id,
                    "{} cannot stop sharing while enrolled in {}",
                    user.id, user.program
                );
                self.client.send(ServerMessage::alert(
                    "Sharing stays on while you are enrolled in a program",
                ));
                return;
            }
            user.share_key = None;
            let snapshot = user.clone();
            info!(session = %self.id, "sharing disabled for {}", snapshot.id);

            self.replace_workspace(None, SHARING_DISABLED);
            handlers::persist_sharing(&self.handlers, snapshot);
        }
    }

    // -------------------------------------------------------------------------
    // Upstream events
    // -------------------------------------------------------------------------

    fn on_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Data { name, data } if name == BUCKET_REPO_CREATED => {
                handlers::bucket_created(&self.handlers, self.user.as_ref(), &data);
            }
            BackendEvent::Data { name, data } => {
                self.client.send(ServerMessage::Passthrough { name, data });
            }
            BackendEvent::Destroy { reason } => self.on_backend_destroy(reason),
        }
    }

    fn on_workspace_event(&mut self, event: WorkspaceEvent) {
        match event {
            WorkspaceEvent::Data { name, data } => {
                self.client.send(ServerMessage::Passthrough { name, data });
            }
            WorkspaceEvent::Message(message) => self.client.send(ServerMessage::Alert { message }),
            WorkspaceEvent::SessCode(code) => self.assign_sess_code(code),
            WorkspaceEvent::Back { name, data } => {
                self.services.metrics.routed_to_backend();
                self.backend.data_d(&name, data);
            }
            WorkspaceEvent::Log(line) => debug!(session = %self.id, "workspace: {}", line),
        }
    }

    /// Propagate a session code to the backend channel, the client and the workspace.
    fn assign_sess_code(&mut self, code: String) {
        info!(session = %self.id, "session code {}", code);
        self.sess_code = Some(code.clone());
        self.backend.set_sess_code(Some(code.clone()));
        self.client.send(ServerMessage::SessCode {
            sess_code: code.clone(),
        });
        if let Some(ws) = self.workspace.as_mut() {
            ws.set_sess_code(&code);
        }
    }

    // -------------------------------------------------------------------------
    // Teardown
    // -------------------------------------------------------------------------

    fn on_client_disconnect(&mut self) {
        if self.destroyed {
            return;
        }
        info!(session = %self.id, "client disconnected");
        self.mark_destroyed(Teardown::Client);
        self.services.metrics.client_teardown();

        if let Some(ws) = self.workspace.as_mut() {
            ws.destroy_d(CLIENT_DISCONNECT);
        }
        self.unbind();
    }

    fn on_backend_destroy(&mut self, reason: String) {
        if self.destroyed {
            return;
        }
        info!(session = %self.id, "backend ended: {}", reason);
        self.client.send(ServerMessage::DestroyU {
            reason: reason.clone(),
        });
        self.mark_destroyed(Teardown::Backend {
            reason: reason.clone(),
        });
        self.services.metrics.backend_teardown();

        self.backend.set_sess_code(None);
        if let Some(ws) = self.workspace.as_mut() {
            ws.destroy_u(&reason);
        }
        self.unbind();
    }

    fn mark_destroyed(&mut self, teardown: Teardown) {
        self.destroyed = true;
        self.teardown = Some(teardown);
        self.handlers.closed.cancel();
    }
}
