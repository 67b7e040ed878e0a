use serde_json::{Value, json};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    DocumentHub, DocumentUpdate, Workspace, WorkspaceEvent, WorkspaceFactory, WorkspaceKind,
    WorkspaceVariant,
};
use crate::session::{Emitter, Listener};
use crate::tokens::random_token;

/// Backend message asking for an execution session to be opened.
pub const SESSION_REQUEST: &str = "oo.session_request";

/// Workspace whose shared documents live in an in-process [`DocumentHub`].
pub struct LocalWorkspace {
    id: String,
    variant: WorkspaceVariant,
    documents: Arc<DocumentHub>,
    sess_code_length: usize,
    sess_code: Option<String>,
    emitter: Emitter<WorkspaceEvent>,
    relay_cancel: Option<CancellationToken>,
    joined: bool,
    destroyed: bool,
}

impl LocalWorkspace {
    pub fn new(variant: WorkspaceVariant, documents: Arc<DocumentHub>, sess_code_length: usize) -> Self {
        let sess_code = variant.initial_sess_code().map(String::from);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            variant,
            documents,
            sess_code_length,
            sess_code,
            emitter: Emitter::new(),
            relay_cancel: None,
            joined: false,
            destroyed: false,
        }
    }

    pub fn sess_code(&self) -> Option<&str> {
        self.sess_code.as_deref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn document_id(&self) -> Option<String> {
        self.variant.document_id().map(String::from)
    }

    fn spawn_relay(&mut self, mut rx: broadcast::Receiver<DocumentUpdate>) {
        let emitter = self.emitter.clone();
        let own_id = self.id.clone();
        let cancel = CancellationToken::new();
        self.relay_cancel = Some(cancel.clone());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    update = rx.recv() => match update {
                        Ok(update) if update.origin == own_id => {}
                        Ok(update) => emitter.emit(WorkspaceEvent::Data {
                            name: update.name,
                            data: update.data,
                        }),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            emitter.emit(WorkspaceEvent::Log(format!(
                                "document relay lagged by {n} updates"
                            )));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn detach(&mut self) {
        if let Some(cancel) = self.relay_cancel.take() {
            cancel.cancel();
        }
        if self.joined {
            if let Some(doc) = self.document_id() {
                self.documents.leave(&doc);
            }
            self.joined = false;
        }
    }

    fn session_request(&self, sess_code: &str, reused: bool) -> Value {
        let bucket_id = match &self.variant {
            WorkspaceVariant::Bucket { bucket_id, .. } => Some(bucket_id.clone()),
            _ => None,
        };
        json!({
            "sessCode": sess_code,
            "kind": self.variant.kind().to_string(),
            "userId": self.variant.user().map(|u| u.id.clone()),
            "program": self.variant.user().map(|u| u.program.clone()),
            "bucketId": bucket_id,
            "reconnect": reused,
        })
    }
}

impl Workspace for LocalWorkspace {
    fn kind(&self) -> WorkspaceKind {
        self.variant.kind()
    }

    fn data_d(&mut self, name: &str, data: Value) {
        if self.destroyed {
            return;
        }
        match self.document_id() {
            Some(doc) => {
                self.documents.publish(
                    &doc,
                    DocumentUpdate {
                        origin: self.id.clone(),
                        name: name.to_string(),
                        data,
                    },
                );
            }
            None if name.starts_with("ot.") || name.starts_with("ws.") => {
                self.emitter.emit(WorkspaceEvent::Log(format!(
                    "no shared document for {name}, dropping"
                )));
            }
            None => {}
        }
    }

    fn begin_octave_request(&mut self) {
        if self.destroyed {
            return;
        }
        let candidate = self
            .sess_code
            .clone()
            .unwrap_or_else(|| random_token(self.sess_code_length));
        let had_code = self.sess_code.is_some();

        let (code, reused) = match self.document_id() {
            Some(doc) => {
                let code = self.documents.claim_sess_code(&doc, candidate.clone());
                let reused = code != candidate || had_code;
                if code != candidate {
                    self.emitter.emit(WorkspaceEvent::Message(
                        "Connected to the shared session already in progress".to_string(),
                    ));
                }
                (code, reused)
            }
            None => (candidate, had_code),
        };

        debug!(workspace = %self.id, kind = %self.kind(), sess_code = %code, reused, "Requesting backend session");
        self.sess_code = Some(code.clone());
        self.emitter.emit(WorkspaceEvent::SessCode(code.clone()));
        self.emitter.emit(WorkspaceEvent::Back {
            name: SESSION_REQUEST.to_string(),
            data: self.session_request(&code, reused),
        });
    }

    fn set_sess_code(&mut self, sess_code: &str) {
        self.sess_code = Some(sess_code.to_string());
        if let Some(doc) = self.document_id() {
            self.documents.set_sess_code(&doc, Some(sess_code.to_string()));
        }
    }

    fn destroy_d(&mut self, reason: &str) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.emitter
            .emit(WorkspaceEvent::Log(format!("destroyed from client side: {reason}")));
        self.detach();
    }

    fn destroy_u(&mut self, reason: &str) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.emitter
            .emit(WorkspaceEvent::Log(format!("destroyed from backend side: {reason}")));
        // The backend session is gone for every viewer of the document.
        if let Some(doc) = self.document_id() {
            self.documents.set_sess_code(&doc, None);
        }
        self.detach();
    }

    fn subscribe(&mut self) {
        if self.destroyed || self.relay_cancel.is_some() {
            return;
        }
        let Some(doc) = self.document_id() else {
            if matches!(
                self.variant,
                WorkspaceVariant::DefaultShared { .. } | WorkspaceVariant::StudentShared { .. }
            ) {
                warn!(workspace = %self.id, "Shared workspace without a share key");
            }
            return;
        };
        let rx = self.documents.join(&doc);
        self.joined = true;
        self.spawn_relay(rx);
    }

    fn unsubscribe(&mut self) {
        self.detach();
    }

    fn add_listener(&mut self, listener: Listener<WorkspaceEvent>) {
        self.emitter.add_listener(listener);
    }

    fn remove_all_listeners(&mut self) {
        self.emitter.remove_all_listeners();
    }
}

impl Drop for LocalWorkspace {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Creates [`LocalWorkspace`]s over a shared [`DocumentHub`].
pub struct LocalWorkspaceFactory {
    documents: Arc<DocumentHub>,
    sess_code_length: usize,
}

impl LocalWorkspaceFactory {
    pub fn new(documents: Arc<DocumentHub>, sess_code_length: usize) -> Self {
        Self {
            documents,
            sess_code_length,
        }
    }
}

impl WorkspaceFactory for LocalWorkspaceFactory {
    fn create(&self, variant: WorkspaceVariant) -> Box<dyn Workspace> {
        Box::new(LocalWorkspace::new(
            variant,
            self.documents.clone(),
            self.sess_code_length,
        ))
    }
}
