//! Routing table for inbound client messages.
//!
//! Precedence, first match wins:
//! 1. exact control names, handled by the session itself
//! 2. reserved prefixes (`ot.`, `ws.`), delivered to the workspace only
//! 3. dual-purpose names (`data`, `save`), delivered to the workspace and the backend
//! 4. everything else, delivered to the backend verbatim

use std::collections::{HashMap, HashSet};

pub const ENROLL: &str = "oo.enroll";
pub const UNENROLL_STUDENT: &str = "oo.unenroll_student";
pub const REENROLL_STUDENT: &str = "oo.reenroll_student";
pub const PING: &str = "oo.ping";
pub const SET_PASSWORD: &str = "oo.set_password";
pub const TOGGLE_SHARING: &str = "oo.toggle_sharing";
pub const DELETE_BUCKET: &str = "oo.delete_bucket";

/// Backend-originated notice that a bucket repository was created.
pub const BUCKET_REPO_CREATED: &str = "bucket-repo-created";

/// Messages handled locally by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlAction {
    /// A repeated `init`; ignored once startup has completed.
    Init,
    Enroll,
    UnenrollStudent,
    ReenrollStudent,
    Ping,
    SetPassword,
    ToggleSharing,
    DeleteBucket,
}

/// Where an inbound client message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Control(ControlAction),
    /// Workspace only; dropped when no workspace is bound.
    Workspace,
    /// Workspace (when bound) and backend.
    WorkspaceAndBackend,
    Backend,
}

#[derive(Debug, Clone)]
pub struct RoutingTable {
    controls: HashMap<&'static str, ControlAction>,
    workspace_prefixes: Vec<&'static str>,
    dual_purpose: HashSet<&'static str>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        let controls = HashMap::from([
            (super::protocol::INIT, ControlAction::Init),
            (ENROLL, ControlAction::Enroll),
            (UNENROLL_STUDENT, ControlAction::UnenrollStudent),
            (REENROLL_STUDENT, ControlAction::ReenrollStudent),
            (PING, ControlAction::Ping),
            (SET_PASSWORD, ControlAction::SetPassword),
            (TOGGLE_SHARING, ControlAction::ToggleSharing),
            (DELETE_BUCKET, ControlAction::DeleteBucket),
        ]);
        Self {
            controls,
            workspace_prefixes: vec!["ot.", "ws."],
            dual_purpose: HashSet::from(["data", "save"]),
        }
    }

    pub fn classify(&self, name: &str) -> Route {
        if let Some(action) = self.controls.get(name) {
            return Route::Control(*action);
        }
        if self
            .workspace_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix))
        {
            return Route::Workspace;
        }
        if self.dual_purpose.contains(name) {
            return Route::WorkspaceAndBackend;
        }
        Route::Backend
    }
}
