//! Shared documents: relay of workspace traffic among viewers, plus the one
//! backend session code all viewers of a document share.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

const DOCUMENT_CAPACITY: usize = 512;

/// One update relayed to every viewer of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentUpdate {
    /// Workspace that produced the update; it does not get its own update back.
    pub origin: String,
    pub name: String,
    pub data: Value,
}

struct Document {
    tx: broadcast::Sender<DocumentUpdate>,
    sess_code: Option<String>,
    viewers: usize,
}

#[derive(Default)]
pub struct DocumentHub {
    docs: Mutex<HashMap<String, Document>>,
}

impl DocumentHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Document>> {
        self.docs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn entry<'a>(docs: &'a mut HashMap<String, Document>, doc_id: &str) -> &'a mut Document {
        docs.entry(doc_id.to_string()).or_insert_with(|| Document {
            tx: broadcast::channel(DOCUMENT_CAPACITY).0,
            sess_code: None,
            viewers: 0,
        })
    }

    /// Register a viewer and return its update stream.
    pub fn join(&self, doc_id: &str) -> broadcast::Receiver<DocumentUpdate> {
        let mut docs = self.lock();
        let doc = Self::entry(&mut docs, doc_id);
        doc.viewers += 1;
        doc.tx.subscribe()
    }

    /// Unregister a viewer. The document is forgotten with its last viewer.
    pub fn leave(&self, doc_id: &str) {
        let mut docs = self.lock();
        if let Some(doc) = docs.get_mut(doc_id) {
            doc.viewers = doc.viewers.saturating_sub(1);
            if doc.viewers == 0 {
                docs.remove(doc_id);
            }
        }
    }

    pub fn publish(&self, doc_id: &str, update: DocumentUpdate) -> usize {
        let docs = self.lock();
        docs.get(doc_id)
            .and_then(|doc| doc.tx.send(update).ok())
            .unwrap_or(0)
    }

    pub fn sess_code(&self, doc_id: &str) -> Option<String> {
        self.lock().get(doc_id).and_then(|d| d.sess_code.clone())
    }

    /// Return the document's session code, installing `candidate` if it has none.
    pub fn claim_sess_code(&self, doc_id: &str, candidate: String) -> String {
        let mut docs = self.lock();
        let doc = Self::entry(&mut docs, doc_id);
        doc.sess_code.get_or_insert(candidate).clone()
    }

    pub fn set_sess_code(&self, doc_id: &str, sess_code: Option<String>) {
        let mut docs = self.lock();
        if let Some(doc) = docs.get_mut(doc_id) {
            doc.sess_code = sess_code;
        }
    }

    pub fn viewer_count(&self, doc_id: &str) -> usize {
        self.lock().get(doc_id).map(|d| d.viewers).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(origin: &str) -> DocumentUpdate {
        DocumentUpdate {
            origin: origin.into(),
            name: "ot.insert".into(),
            data: json!({"pos": 0, "text": "x"}),
        }
    }

    #[test]
    fn viewers_receive_published_updates() {
        let hub = DocumentHub::new();
        let mut a = hub.join("doc");
        let mut b = hub.join("doc");
        assert_eq!(hub.viewer_count("doc"), 2);

        assert_eq!(hub.publish("doc", update("a")), 2);
        assert_eq!(a.try_recv().unwrap().origin, "a");
        assert_eq!(b.try_recv().unwrap().name, "ot.insert");
    }

    #[test]
    fn publishing_to_unknown_document_reaches_nobody() {
        let hub = DocumentHub::new();
        assert_eq!(hub.publish("nope", update("a")), 0);
    }

    #[test]
    fn first_claim_wins() {
        let hub = DocumentHub::new();
        let _rx = hub.join("doc");
        assert_eq!(hub.claim_sess_code("doc", "first".into()), "first");
        assert_eq!(hub.claim_sess_code("doc", "second".into()), "first");
        assert_eq!(hub.sess_code("doc").as_deref(), Some("first"));
    }

    #[test]
    fn last_viewer_leaving_forgets_document() {
        let hub = DocumentHub::new();
        let _a = hub.join("doc");
        let _b = hub.join("doc");
        hub.claim_sess_code("doc", "code".into());
        hub.leave("doc");
        assert_eq!(hub.sess_code("doc").as_deref(), Some("code"));
        hub.leave("doc");
        assert_eq!(hub.viewer_count("doc"), 0);
        assert!(hub.sess_code("doc").is_none());
        // Extra leave is harmless
        hub.leave("doc");
    }
}
