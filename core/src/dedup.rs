/// Duplicate suppression across delivery paths
///
/// The same message can reach the session up to three times: live push,
/// REST persistence fallback, and the history reload on room entry.
/// Identified messages dedup on their id for the whole session;
/// identifier-less messages dedup on a (sender, content) signature
/// inside a short arrival window. A third set tracks locally sent
/// content so the server echo confirms delivery instead of appending
/// a second copy.
use crate::message::ChatMessage;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Signature for windowed duplicate detection: sender plus content
pub fn content_signature(message: &ChatMessage) -> String {
    let who = message
        .sender_username
        .as_deref()
        .or(message.sender_id.as_deref())
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    format!("rc:{}|{}", who, message.content)
}

/// Signature for the local-echo window: room plus content
pub fn pending_signature(room_id: &str, content: &str) -> String {
    format!("{}:{}", room_id, content.trim().to_lowercase())
}

pub struct Deduplicator {
    seen_ids: HashSet<String>,
    recent: HashMap<String, Instant>,
    pending_sent: HashMap<String, Instant>,
    signature_window: Duration,
    echo_window: Duration,
}

impl Deduplicator {
    pub fn new(signature_window: Duration, echo_window: Duration) -> Self {
        Self {
            seen_ids: HashSet::new(),
            recent: HashMap::new(),
            pending_sent: HashMap::new(),
            signature_window,
            echo_window,
        }
    }

    /// Forget everything; called on room change and disconnect
    pub fn reset(&mut self) {
        self.seen_ids.clear();
        self.recent.clear();
        self.pending_sent.clear();
    }

    pub fn id_seen(&self, id: &str) -> bool {
        self.seen_ids.contains(id)
    }

    pub fn remember_id(&mut self, id: &str) {
        self.seen_ids.insert(id.to_string());
    }

    /// Windowed signature check. Returns `true` when the signature was
    /// admitted within the window (caller discards the message); on
    /// `false` the signature's clock is (re)started.
    pub fn recently_admitted(&mut self, signature: &str) -> bool {
        let now = Instant::now();
        let window = self.signature_window;
        self.recent.retain(|_, at| now.duration_since(*at) < window);
        if self.recent.contains_key(signature) {
            return true;
        }
        self.recent.insert(signature.to_string(), now);
        false
    }

    /// Record a locally sent message before it is published
    pub fn register_pending(&mut self, signature: String) {
        let now = Instant::now();
        let window = self.echo_window;
        self.pending_sent
            .retain(|_, at| now.duration_since(*at) < window);
        self.pending_sent.insert(signature, now);
    }

    /// Consume a pending-sent entry if one is still inside the echo
    /// window. Returns `true` exactly once per registration.
    pub fn consume_pending(&mut self, signature: &str) -> bool {
        match self.pending_sent.remove(signature) {
            Some(at) => at.elapsed() < self.echo_window,
            None => false,
        }
    }
}
