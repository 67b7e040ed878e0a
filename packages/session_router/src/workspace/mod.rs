//! Workspaces
//!
//! A workspace is the collaborative surface a session attaches to. All
//! variants expose the same capabilities; they differ only in how they
//! resolve which shared document (if any) they belong to.

mod document_hub;
mod local;

pub use document_hub::{DocumentHub, DocumentUpdate};
pub use local::{LocalWorkspace, LocalWorkspaceFactory, SESSION_REQUEST};

use serde_json::Value;
use std::fmt;

use crate::models::UserProfile;
use crate::session::Listener;
use crate::session::protocol::{InitAction, InitRequest};

/// Events a workspace emits towards the session.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkspaceEvent {
    /// Data for the client, relayed unchanged.
    Data { name: String, data: Value },
    /// Console-style notice for the client.
    Message(String),
    /// The workspace resolved or created a session code.
    SessCode(String),
    /// Data for the backend channel.
    Back { name: String, data: Value },
    /// Local diagnostics only.
    Log(String),
}

/// How a session's workspace was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceVariant {
    /// Viewer of someone's shared workspace, addressed by share key.
    DefaultShared { info: Option<String> },
    /// Instructor viewing a student's shared workspace.
    StudentShared { info: Option<String> },
    /// Owner of a shared workspace.
    Host { user: UserProfile },
    /// Session backed by a stored bucket.
    Bucket {
        sess_code: Option<String>,
        user: Option<UserProfile>,
        bucket_id: String,
    },
    /// Private, unshared session.
    Normal {
        sess_code: Option<String>,
        user: Option<UserProfile>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceKind {
    DefaultShared,
    StudentShared,
    Host,
    Bucket,
    Normal,
}

impl fmt::Display for WorkspaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkspaceKind::DefaultShared => "default-shared",
            WorkspaceKind::StudentShared => "student-shared",
            WorkspaceKind::Host => "host",
            WorkspaceKind::Bucket => "bucket",
            WorkspaceKind::Normal => "normal",
        };
        f.write_str(s)
    }
}

impl WorkspaceVariant {
    /// Pick the variant for a fresh session from the client's init request.
    pub fn select(init: &InitRequest, user: Option<&UserProfile>) -> Self {
        match init.action {
            InitAction::Workspace => WorkspaceVariant::DefaultShared {
                info: init.info.clone(),
            },
            InitAction::Student => WorkspaceVariant::StudentShared {
                info: init.info.clone(),
            },
            InitAction::Bucket => WorkspaceVariant::Bucket {
                sess_code: init.sess_code.clone(),
                user: user.cloned(),
                bucket_id: init.info.clone().unwrap_or_default(),
            },
            InitAction::Session => match user {
                Some(u) if u.share_key.is_some() => WorkspaceVariant::Host { user: u.clone() },
                _ => WorkspaceVariant::Normal {
                    sess_code: init.sess_code.clone(),
                    user: user.cloned(),
                },
            },
        }
    }

    pub fn kind(&self) -> WorkspaceKind {
        match self {
            WorkspaceVariant::DefaultShared { .. } => WorkspaceKind::DefaultShared,
            WorkspaceVariant::StudentShared { .. } => WorkspaceKind::StudentShared,
            WorkspaceVariant::Host { .. } => WorkspaceKind::Host,
            WorkspaceVariant::Bucket { .. } => WorkspaceKind::Bucket,
            WorkspaceVariant::Normal { .. } => WorkspaceKind::Normal,
        }
    }

    /// The shared document this variant attaches to, if any.
    pub fn document_id(&self) -> Option<&str> {
        match self {
            WorkspaceVariant::DefaultShared { info } | WorkspaceVariant::StudentShared { info } => {
                info.as_deref().filter(|s| !s.is_empty())
            }
            WorkspaceVariant::Host { user } => user.share_key.as_deref(),
            WorkspaceVariant::Bucket { .. } | WorkspaceVariant::Normal { .. } => None,
        }
    }

    /// Session code carried over from a previous connection.
    pub fn initial_sess_code(&self) -> Option<&str> {
        match self {
            WorkspaceVariant::Bucket { sess_code, .. } | WorkspaceVariant::Normal { sess_code, .. } => {
                sess_code.as_deref()
            }
            _ => None,
        }
    }

    pub fn user(&self) -> Option<&UserProfile> {
        match self {
            WorkspaceVariant::Host { user } => Some(user),
            WorkspaceVariant::Bucket { user, .. } | WorkspaceVariant::Normal { user, .. } => {
                user.as_ref()
            }
            _ => None,
        }
    }
}

/// Capabilities every workspace variant provides to the session.
pub trait Workspace: Send {
    fn kind(&self) -> WorkspaceKind;

    /// Accept downstream-originated (client) data.
    fn data_d(&mut self, name: &str, data: Value);

    /// Ask for the backend execution session to be opened.
    fn begin_octave_request(&mut self);

    /// Record the session code assigned to this session.
    fn set_sess_code(&mut self, sess_code: &str);

    /// Tear down because the client side went away.
    fn destroy_d(&mut self, reason: &str);

    /// Tear down because the backend side went away.
    fn destroy_u(&mut self, reason: &str);

    fn subscribe(&mut self);

    fn unsubscribe(&mut self);

    fn add_listener(&mut self, listener: Listener<WorkspaceEvent>);

    fn remove_all_listeners(&mut self);
}

/// Builds workspaces for sessions.
pub trait WorkspaceFactory: Send + Sync {
    fn create(&self, variant: WorkspaceVariant) -> Box<dyn Workspace>;
}
