//! In-process backend transport.
//!
//! Each session code owns a topic pair: `upstream` carries session → worker
//! traffic and `downstream` carries worker → session traffic. Workers attach
//! through [`BackendHub::worker`].

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{BackendChannel, BackendEvent};
use crate::session::{Emitter, Listener};

/// Default per-topic buffer.
pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

/// Session → worker message.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamMessage {
    pub name: String,
    pub data: Value,
}

/// Worker → session message.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    Data { name: String, data: Value },
    Destroy { reason: String },
}

impl From<BackendMessage> for BackendEvent {
    fn from(msg: BackendMessage) -> Self {
        match msg {
            BackendMessage::Data { name, data } => BackendEvent::Data { name, data },
            BackendMessage::Destroy { reason } => BackendEvent::Destroy { reason },
        }
    }
}

#[derive(Clone)]
struct Topic {
    upstream: broadcast::Sender<UpstreamMessage>,
    downstream: broadcast::Sender<BackendMessage>,
}

pub struct BackendHub {
    topics: Mutex<HashMap<String, Topic>>,
    capacity: usize,
}

impl BackendHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Topic>> {
        self.topics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn topic(&self, sess_code: &str) -> Topic {
        let mut topics = self.lock();
        topics
            .entry(sess_code.to_string())
            .or_insert_with(|| {
                let (upstream, _) = broadcast::channel(self.capacity);
                let (downstream, _) = broadcast::channel(self.capacity);
                Topic {
                    upstream,
                    downstream,
                }
            })
            .clone()
    }

    /// Publish session data to the worker. Returns the number of workers reached.
    pub fn publish_upstream(&self, sess_code: &str, msg: UpstreamMessage) -> usize {
        self.topic(sess_code).upstream.send(msg).unwrap_or(0)
    }

    pub fn subscribe_downstream(&self, sess_code: &str) -> broadcast::Receiver<BackendMessage> {
        self.topic(sess_code).downstream.subscribe()
    }

    /// Attach a worker to a session code.
    pub fn worker(&self, sess_code: &str) -> WorkerEndpoint {
        let topic = self.topic(sess_code);
        WorkerEndpoint {
            sess_code: sess_code.to_string(),
            upstream: topic.upstream.subscribe(),
            downstream: topic.downstream,
        }
    }

    /// Drop topics nobody is listening to on either side.
    pub fn prune(&self) -> usize {
        let mut topics = self.lock();
        let before = topics.len();
        topics.retain(|_, t| t.upstream.receiver_count() > 0 || t.downstream.receiver_count() > 0);
        before - topics.len()
    }

    pub fn topic_count(&self) -> usize {
        self.lock().len()
    }
}

impl Default for BackendHub {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

/// Worker side of a topic.
pub struct WorkerEndpoint {
    sess_code: String,
    upstream: broadcast::Receiver<UpstreamMessage>,
    downstream: broadcast::Sender<BackendMessage>,
}

impl WorkerEndpoint {
    pub fn sess_code(&self) -> &str {
        &self.sess_code
    }

    /// Next message from the session, skipping over lag.
    pub async fn recv(&mut self) -> Option<UpstreamMessage> {
        loop {
            match self.upstream.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(sess_code = %self.sess_code, "Worker lagged by {} messages", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<UpstreamMessage> {
        self.upstream.try_recv().ok()
    }

    pub fn send(&self, name: impl Into<String>, data: Value) {
        let _ = self.downstream.send(BackendMessage::Data {
            name: name.into(),
            data,
        });
    }

    pub fn destroy(&self, reason: impl Into<String>) {
        let _ = self.downstream.send(BackendMessage::Destroy {
            reason: reason.into(),
        });
    }
}

/// Session side of a topic, implementing [`BackendChannel`].
pub struct HubBackendChannel {
    hub: Arc<BackendHub>,
    sess_code: Option<String>,
    emitter: Emitter<BackendEvent>,
    subscribed: bool,
    forward_cancel: Option<CancellationToken>,
}

impl HubBackendChannel {
    pub fn new(hub: Arc<BackendHub>) -> Self {
        Self {
            hub,
            sess_code: None,
            emitter: Emitter::new(),
            subscribed: false,
            forward_cancel: None,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    fn stop_forwarding(&mut self) {
        if let Some(cancel) = self.forward_cancel.take() {
            cancel.cancel();
        }
    }

    fn start_forwarding(&mut self) {
        self.stop_forwarding();
        let Some(code) = self.sess_code.clone() else {
            return;
        };
        let mut rx = self.hub.subscribe_downstream(&code);
        let emitter = self.emitter.clone();
        let cancel = CancellationToken::new();
        self.forward_cancel = Some(cancel.clone());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(msg) => emitter.emit(msg.into()),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(sess_code = %code, "Backend subscription lagged by {} messages", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(sess_code = %code, "Backend forwarding stopped");
        });
    }
}

impl BackendChannel for HubBackendChannel {
    fn data_d(&mut self, name: &str, data: Value) {
        match &self.sess_code {
            Some(code) => {
                let reached = self.hub.publish_upstream(
                    code,
                    UpstreamMessage {
                        name: name.to_string(),
                        data,
                    },
                );
                if reached == 0 {
                    debug!(sess_code = %code, name, "No worker listening for message");
                }
            }
            None => debug!(name, "Dropping backend message: no session code yet"),
        }
    }

    fn set_sess_code(&mut self, sess_code: Option<String>) {
        if self.sess_code == sess_code {
            return;
        }
        self.sess_code = sess_code;
        if self.subscribed {
            self.start_forwarding();
        }
    }

    fn sess_code(&self) -> Option<&str> {
        self.sess_code.as_deref()
    }

    fn subscribe(&mut self) {
        self.subscribed = true;
        self.start_forwarding();
    }

    fn unsubscribe(&mut self) {
        self.subscribed = false;
        self.stop_forwarding();
    }

    fn add_listener(&mut self, listener: Listener<BackendEvent>) {
        self.emitter.add_listener(listener);
    }

    fn remove_all_listeners(&mut self) {
        self.emitter.remove_all_listeners();
    }
}

impl Drop for HubBackendChannel {
    fn drop(&mut self) {
        self.stop_forwarding();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio::time::{Duration, timeout};

    fn channel_with_listener(
        hub: &Arc<BackendHub>,
    ) -> (HubBackendChannel, mpsc::UnboundedReceiver<BackendEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channel = HubBackendChannel::new(hub.clone());
        channel.add_listener(Listener::new(move |e| {
            let _ = tx.send(e);
        }));
        (channel, rx)
    }

    #[tokio::test]
    async fn data_reaches_worker_once_code_is_set() {
        let hub = Arc::new(BackendHub::default());
        let mut worker = hub.worker("abc123");
        let (mut channel, _rx) = channel_with_listener(&hub);

        channel.data_d("cmd", json!("x = 1"));
        assert!(worker.try_recv().is_none());

        channel.set_sess_code(Some("abc123".into()));
        channel.data_d("cmd", json!("x = 1"));
        let msg = timeout(Duration::from_secs(1), worker.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.name, "cmd");
        assert_eq!(msg.data, json!("x = 1"));
    }

    #[tokio::test]
    async fn subscribed_channel_receives_worker_output() {
        let hub = Arc::new(BackendHub::default());
        let (mut channel, mut rx) = channel_with_listener(&hub);
        channel.set_sess_code(Some("abc123".into()));
        channel.subscribe();

        let worker = hub.worker("abc123");
        worker.send("data", json!({"type": "stdout"}));
        worker.destroy("Idle Timeout");

        let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(
            first,
            Some(BackendEvent::Data {
                name: "data".into(),
                data: json!({"type": "stdout"})
            })
        );
        let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(
            second,
            Some(BackendEvent::Destroy {
                reason: "Idle Timeout".into()
            })
        );
    }

    #[tokio::test]
    async fn unsubscribed_channel_ignores_worker_output() {
        let hub = Arc::new(BackendHub::default());
        let (mut channel, mut rx) = channel_with_listener(&hub);
        channel.set_sess_code(Some("abc123".into()));
        channel.subscribe();
        channel.unsubscribe();
        tokio::task::yield_now().await;

        hub.worker("abc123").send("data", json!(1));
        assert!(
            timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
            "no event expected after unsubscribe"
        );
    }

    #[tokio::test]
    async fn changing_code_moves_subscription() {
        let hub = Arc::new(BackendHub::default());
        let (mut channel, mut rx) = channel_with_listener(&hub);
        channel.subscribe();
        channel.set_sess_code(Some("old".into()));
        channel.set_sess_code(Some("new".into()));

        hub.worker("old").send("data", json!("stale"));
        hub.worker("new").send("data", json!("fresh"));

        let event = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(
            event,
            Some(BackendEvent::Data {
                name: "data".into(),
                data: json!("fresh")
            })
        );
    }

    #[test]
    fn prune_removes_idle_topics() {
        let hub = BackendHub::default();
        let worker = hub.worker("abc");
        let _ = hub.subscribe_downstream("def");
        assert_eq!(hub.topic_count(), 2);
        assert_eq!(hub.prune(), 1);
        drop(worker);
        assert_eq!(hub.prune(), 1);
        assert_eq!(hub.topic_count(), 0);
    }
}
