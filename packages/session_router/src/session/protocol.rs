//! Session Protocol Types
//!
//! Message types exchanged with the end-user connection. Every frame on the
//! wire is an [`Envelope`]: `{"name": ..., "data": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{BucketRecord, ProfileSummary};

/// Name of the one-time startup frame, in both directions.
pub const INIT: &str = "init";

/// Wire frame shared by client and server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }
}

/// Which kind of session the client asked for in its `init` frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitAction {
    /// Attach to a shared workspace by share key.
    Workspace,
    /// Instructor view of a student's shared workspace.
    Student,
    /// Open a session backed by a stored bucket.
    Bucket,
    /// Plain session (the default for unknown actions too).
    #[default]
    #[serde(other)]
    Session,
}

/// The client's startup payload. Consumed exactly once per session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    #[serde(default)]
    pub action: InitAction,
    /// Share key, student id, or bucket id depending on `action`.
    #[serde(default)]
    pub info: Option<String>,
    /// Session code from a previous connection, for reconnects.
    #[serde(default)]
    pub sess_code: Option<String>,
    /// Suppress the default backend-connect request.
    #[serde(default)]
    pub skip_create: bool,
}

/// Events produced by the client channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Init(InitRequest),
    Message { name: String, data: Value },
    Disconnect,
}

impl ClientEvent {
    /// Decode a wire frame. An `init` frame whose payload does not parse is an error.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, serde_json::Error> {
        if envelope.name == INIT {
            let request = if envelope.data.is_null() {
                InitRequest::default()
            } else {
                serde_json::from_value(envelope.data)?
            };
            return Ok(ClientEvent::Init(request));
        }
        Ok(ClientEvent::Message {
            name: envelope.name,
            data: envelope.data,
        })
    }
}

/// Messages sent from the session to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Readiness signal; the client answers with its `init` frame.
    Init,
    /// Console-style notice shown to the user.
    Alert { message: String },
    SessCode { sess_code: String },
    /// The backend session is gone.
    DestroyU { reason: String },
    /// Students enrolled in one of the user's instructor programs.
    Instructor {
        program: String,
        users: Vec<ProfileSummary>,
    },
    AllBuckets { buckets: Vec<BucketRecord> },
    BucketInfo { bucket: BucketRecord },
    BucketCreated { bucket: BucketRecord },
    BucketDeleted { bucket_id: String },
    /// Ask the client to reload the page.
    Reload,
    Pong { start_time: Value },
    /// Backend or workspace data relayed unchanged.
    Passthrough { name: String, data: Value },
}

impl ServerMessage {
    pub fn alert(message: impl Into<String>) -> Self {
        ServerMessage::Alert {
            message: message.into(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ServerMessage::Init => INIT,
            ServerMessage::Alert { .. } => "alert",
            ServerMessage::SessCode { .. } => "sesscode",
            ServerMessage::DestroyU { .. } => "destroy-u",
            ServerMessage::Instructor { .. } => "instructor",
            ServerMessage::AllBuckets { .. } => "all-buckets",
            ServerMessage::BucketInfo { .. } => "bucket-info",
            ServerMessage::BucketCreated { .. } => "bucket-created",
            ServerMessage::BucketDeleted { .. } => "bucket-deleted",
            ServerMessage::Reload => "reload",
            ServerMessage::Pong { .. } => "oo.pong",
            ServerMessage::Passthrough { name, .. } => name,
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let data = match self {
            ServerMessage::Init | ServerMessage::Reload => Value::Null,
            ServerMessage::Alert { message } => Value::String(message.clone()),
            ServerMessage::SessCode { sess_code } => serde_json::json!({ "sessCode": sess_code }),
            ServerMessage::DestroyU { reason } => Value::String(reason.clone()),
            ServerMessage::Instructor { program, users } => {
                serde_json::json!({ "program": program, "users": users })
            }
            ServerMessage::AllBuckets { buckets } => serde_json::json!({ "buckets": buckets }),
            ServerMessage::BucketInfo { bucket } | ServerMessage::BucketCreated { bucket } => {
                serde_json::to_value(bucket).unwrap_or(Value::Null)
            }
            ServerMessage::BucketDeleted { bucket_id } => {
                serde_json::json!({ "bucket_id": bucket_id })
            }
            ServerMessage::Pong { start_time } => serde_json::json!({ "startTime": start_time }),
            ServerMessage::Passthrough { data, .. } => data.clone(),
        };
        Envelope::new(self.name(), data)
    }
}
