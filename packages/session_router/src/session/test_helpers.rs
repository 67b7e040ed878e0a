//! Recording fakes for the three channels a session talks to, plus a harness
//! that runs a real session task against them.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::protocol::{ClientEvent, InitRequest, ServerMessage};
use super::{ClientChannel, Emitter, Listener, SessionOutcome, SessionServices, spawn_session};
use crate::backend::{BackendChannel, BackendEvent};
use crate::config::SessionConfig;
use crate::metrics::ServerMetrics;
use crate::models::{BucketRecord, UserProfile};
use crate::store::{BucketStore, ProfileStore, StoreError};
use crate::workspace::{
    SESSION_REQUEST, Workspace, WorkspaceEvent, WorkspaceFactory, WorkspaceKind, WorkspaceVariant,
};

const WAIT: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(5);

/// Poll `check` until it yields a value, panicking after a couple of seconds.
pub(crate) async fn eventually<T>(what: &str, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(value) = check() {
            return value;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(POLL).await;
    }
}

// =============================================================================
// Client
// =============================================================================

#[derive(Clone, Default)]
pub(crate) struct FakeClient {
    emitter: Emitter<ClientEvent>,
    sent: Arc<Mutex<Vec<ServerMessage>>>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an inbound client event.
    pub fn push(&self, event: ClientEvent) {
        self.emitter.emit(event);
    }

    pub fn sent(&self) -> Vec<ServerMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn listener_count(&self) -> usize {
        self.emitter.listener_count()
    }

    pub async fn wait_for(&self, what: &str, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
        eventually(what, || self.sent().into_iter().find(|m| pred(m))).await
    }

    pub fn count(&self, name: &str) -> usize {
        self.sent().iter().filter(|m| m.name() == name).count()
    }
}

impl ClientChannel for FakeClient {
    fn send(&self, msg: ServerMessage) {
        self.sent.lock().unwrap().push(msg);
    }

    fn add_listener(&self, listener: Listener<ClientEvent>) {
        self.emitter.add_listener(listener);
    }

    fn remove_all_listeners(&self) {
        self.emitter.remove_all_listeners();
    }
}

// =============================================================================
// Backend
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct BackendRecord {
    pub sent: Vec<(String, Value)>,
    pub sess_codes: Vec<Option<String>>,
    pub subscribed: bool,
}

/// Clones share the recording; tests keep one and hand the other to the session.
#[derive(Clone, Default)]
pub(crate) struct FakeBackend {
    emitter: Emitter<BackendEvent>,
    record: Arc<Mutex<BackendRecord>>,
    sess_code: Option<String>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: BackendEvent) {
        self.emitter.emit(event);
    }

    pub fn listener_count(&self) -> usize {
        self.emitter.listener_count()
    }

    pub fn sent_names(&self) -> Vec<String> {
        self.record
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn sess_codes(&self) -> Vec<Option<String>> {
        self.record.lock().unwrap().sess_codes.clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.record.lock().unwrap().subscribed
    }
}

impl BackendChannel for FakeBackend {
    fn data_d(&mut self, name: &str, data: Value) {
        self.record
            .lock()
            .unwrap()
            .sent
            .push((name.to_string(), data));
    }

    fn set_sess_code(&mut self, sess_code: Option<String>) {
        self.record.lock().unwrap().sess_codes.push(sess_code.clone());
        self.sess_code = sess_code;
    }

    fn sess_code(&self) -> Option<&str> {
        self.sess_code.as_deref()
    }

    fn subscribe(&mut self) {
        self.record.lock().unwrap().subscribed = true;
    }

    fn unsubscribe(&mut self) {
        self.record.lock().unwrap().subscribed = false;
    }

    fn add_listener(&mut self, listener: Listener<BackendEvent>) {
        self.emitter.add_listener(listener);
    }

    fn remove_all_listeners(&mut self) {
        self.emitter.remove_all_listeners();
    }
}

// =============================================================================
// Workspace
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct WorkspaceRecord {
    pub data: Vec<(String, Value)>,
    pub begin_calls: usize,
    pub sess_codes: Vec<String>,
    pub destroyed_d: Vec<String>,
    pub destroyed_u: Vec<String>,
    pub subscribed: bool,
}

/// Workspace that records every call. `begin_octave_request` emits the
/// variant's prior code (or a fixed one) followed by a session request.
#[derive(Clone)]
pub(crate) struct FakeWorkspace {
    pub variant: WorkspaceVariant,
    emitter: Emitter<WorkspaceEvent>,
    record: Arc<Mutex<WorkspaceRecord>>,
}

pub(crate) const GENERATED_CODE: &str = "generated-code";

impl FakeWorkspace {
    fn new(variant: WorkspaceVariant) -> Self {
        Self {
            variant,
            emitter: Emitter::new(),
            record: Arc::new(Mutex::new(WorkspaceRecord::default())),
        }
    }

    pub fn emit(&self, event: WorkspaceEvent) {
        self.emitter.emit(event);
    }

    pub fn listener_count(&self) -> usize {
        self.emitter.listener_count()
    }

    pub fn record<T>(&self, f: impl FnOnce(&WorkspaceRecord) -> T) -> T {
        f(&self.record.lock().unwrap())
    }

    pub fn data_names(&self) -> Vec<String> {
        self.record(|r| r.data.iter().map(|(n, _)| n.clone()).collect())
    }
}

impl Workspace for FakeWorkspace {
    fn kind(&self) -> WorkspaceKind {
        self.variant.kind()
    }

    fn data_d(&mut self, name: &str, data: Value) {
        self.record.lock().unwrap().data.push((name.to_string(), data));
    }

    fn begin_octave_request(&mut self) {
        self.record.lock().unwrap().begin_calls += 1;
        let code = self
            .variant
            .initial_sess_code()
            .unwrap_or(GENERATED_CODE)
            .to_string();
        self.emitter.emit(WorkspaceEvent::SessCode(code.clone()));
        self.emitter.emit(WorkspaceEvent::Back {
            name: SESSION_REQUEST.to_string(),
            data: json!({ "sessCode": code }),
        });
    }

    fn set_sess_code(&mut self, sess_code: &str) {
        self.record
            .lock()
            .unwrap()
            .sess_codes
            .push(sess_code.to_string());
    }

    fn destroy_d(&mut self, reason: &str) {
        self.record
            .lock()
            .unwrap()
            .destroyed_d
            .push(reason.to_string());
    }

    fn destroy_u(&mut self, reason: &str) {
        self.record
            .lock()
            .unwrap()
            .destroyed_u
            .push(reason.to_string());
    }

    fn subscribe(&mut self) {
        self.record.lock().unwrap().subscribed = true;
    }

    fn unsubscribe(&mut self) {
        self.record.lock().unwrap().subscribed = false;
    }

    fn add_listener(&mut self, listener: Listener<WorkspaceEvent>) {
        self.emitter.add_listener(listener);
    }

    fn remove_all_listeners(&mut self) {
        self.emitter.remove_all_listeners();
    }
}

/// Keeps a handle on every workspace it creates.
#[derive(Clone, Default)]
pub(crate) struct FakeWorkspaceFactory {
    created: Arc<Mutex<Vec<FakeWorkspace>>>,
}

impl FakeWorkspaceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> Vec<FakeWorkspace> {
        self.created.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Option<FakeWorkspace> {
        self.created.lock().unwrap().last().cloned()
    }
}

impl WorkspaceFactory for FakeWorkspaceFactory {
    fn create(&self, variant: WorkspaceVariant) -> Box<dyn Workspace> {
        let ws = FakeWorkspace::new(variant);
        self.created.lock().unwrap().push(ws.clone());
        Box::new(ws)
    }
}

// =============================================================================
// Stores
// =============================================================================

/// A store whose every call fails.
pub(crate) struct FailingStore;

fn unavailable() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

#[async_trait]
impl ProfileStore for FailingStore {
    async fn find_by_id(&self, _id: &str) -> Result<Option<UserProfile>, StoreError> {
        Err(unavailable())
    }

    async fn find_by_program(&self, _program: &str) -> Result<Vec<UserProfile>, StoreError> {
        Err(unavailable())
    }

    async fn save(&self, _profile: &UserProfile) -> Result<(), StoreError> {
        Err(unavailable())
    }

    async fn touch_last_activity(&self, _id: &str) -> Result<(), StoreError> {
        Err(unavailable())
    }

    async fn set_password(&self, _id: &str, _password: &str) -> Result<(), StoreError> {
        Err(unavailable())
    }
}

#[async_trait]
impl BucketStore for FailingStore {
    async fn find_by_id(&self, _id: &str) -> Result<Option<BucketRecord>, StoreError> {
        Err(unavailable())
    }

    async fn find_by_user(&self, _user_id: &str) -> Result<Vec<BucketRecord>, StoreError> {
        Err(unavailable())
    }

    async fn save(&self, _bucket: &BucketRecord) -> Result<(), StoreError> {
        Err(unavailable())
    }

    async fn remove(&self, _id: &str) -> Result<(), StoreError> {
        Err(unavailable())
    }
}

pub(crate) fn services(
    profiles: Arc<dyn ProfileStore>,
    buckets: Arc<dyn BucketStore>,
    factory: &FakeWorkspaceFactory,
) -> SessionServices {
    SessionServices {
        profiles,
        buckets,
        workspaces: Arc::new(factory.clone()),
        config: SessionConfig::default(),
        metrics: Arc::new(ServerMetrics::new()),
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A spawned session wired to fakes.
pub(crate) struct Harness {
    pub client: FakeClient,
    pub backend: FakeBackend,
    pub factory: FakeWorkspaceFactory,
    pub metrics: Arc<ServerMetrics>,
    task: JoinHandle<SessionOutcome>,
    pings: AtomicU64,
}

impl Harness {
    pub fn start(
        user_id: Option<&str>,
        profiles: Arc<dyn ProfileStore>,
        buckets: Arc<dyn BucketStore>,
    ) -> Self {
        let client = FakeClient::new();
        let backend = FakeBackend::new();
        let factory = FakeWorkspaceFactory::new();
        let services = services(profiles, buckets, &factory);
        let metrics = services.metrics.clone();
        let task = spawn_session(
            Arc::new(client.clone()),
            Box::new(backend.clone()),
            user_id.map(String::from),
            services,
        );
        Self {
            client,
            backend,
            factory,
            metrics,
            task,
            pings: AtomicU64::new(0),
        }
    }

    pub fn init(&self, init: InitRequest) {
        self.client.push(ClientEvent::Init(init));
    }

    pub fn send(&self, name: &str, data: Value) {
        self.client.push(ClientEvent::Message {
            name: name.to_string(),
            data,
        });
    }

    /// Wait for the startup join to create the first workspace.
    pub async fn joined(&self) -> FakeWorkspace {
        eventually("workspace creation", || self.factory.latest()).await
    }

    /// Round-trip a ping so everything queued before it has been handled.
    pub async fn sync(&self) {
        let n = self.pings.fetch_add(1, Ordering::Relaxed) + 1_000_000;
        self.send(super::routing::PING, json!({ "startTime": n }));
        self.client
            .wait_for("pong", |m| {
                matches!(m, ServerMessage::Pong { start_time } if *start_time == json!(n))
            })
            .await;
    }

    /// Wait for the session task to end on its own.
    pub async fn ended(self) -> SessionOutcome {
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("session did not end")
            .expect("session task panicked")
    }

    /// Disconnect the client and collect the outcome.
    pub async fn disconnect(self) -> SessionOutcome {
        self.client.push(ClientEvent::Disconnect);
        self.ended().await
    }
}
