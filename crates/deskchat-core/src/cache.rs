//! Per-target inbound message cache.
//!
//! The cache is the only state the inbound dispatch callback touches; it has
//! its own lock and never takes the session lock, so message delivery is
//! never blocked by an in-flight outbound operation (and vice versa).
//!
//! Consumption is exactly-once: a drain pops the target's whole queue, and a
//! later drain of the same target starts empty. A drain without a target
//! returns exactly one non-empty target's backlog (first found, not
//! round-robin) — a deliberately preserved legacy contract.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use deskchat_backend::{PendingArtifact, RawInboundEvent};
use deskchat_observability::redact_text;
use deskchat_types::{normalize_target_name, CachedMessage, MessageKind};

/// Failure modes of the (out-of-scope) attachment persistence routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactError {
    /// The routine did not finish within the budget.
    TimedOut,
    Failed(String),
}

/// Resolves a pending attachment to a local artifact path. Implementations
/// must respect `budget`: the callback may not block past it.
pub trait ArtifactStore: Send + Sync {
    fn persist(
        &self,
        target: &str,
        artifact: &PendingArtifact,
        budget: Duration,
    ) -> Result<String, ArtifactError>;
}

/// Default store: reserves a unique destination path under the artifact
/// directory. The native layer writes the payload to the returned path.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn persist(
        &self,
        target: &str,
        artifact: &PendingArtifact,
        _budget: Duration,
    ) -> Result<String, ArtifactError> {
        let safe_target: String = target
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
            .collect();
        let dir = self.root.join(safe_target);
        std::fs::create_dir_all(&dir).map_err(|e| ArtifactError::Failed(e.to_string()))?;
        let name = format!("{}-{}", Uuid::new_v4(), artifact.suggested_name);
        Ok(dir.join(name).display().to_string())
    }
}

/// Map a native message kind tag onto the normalized kind set.
pub fn parse_kind(raw: &str) -> MessageKind {
    match raw.trim().to_lowercase().as_str() {
        "text" | "friend" | "self" => MessageKind::Text,
        "image" | "pic" => MessageKind::Image,
        "file" => MessageKind::File,
        "voice" => MessageKind::Voice,
        "video" => MessageKind::Video,
        "sys" | "system" => MessageKind::System,
        "time" => MessageKind::Time,
        "recall" => MessageKind::Recall,
        _ => MessageKind::System,
    }
}

pub struct MessageCache {
    /// target -> FIFO queue. BTreeMap keeps the no-target drain fallback
    /// deterministic.
    queues: Mutex<BTreeMap<String, VecDeque<CachedMessage>>>,
    store: Box<dyn ArtifactStore>,
    persist_budget: Duration,
    max_per_target: usize,
}

impl MessageCache {
    pub fn new(store: Box<dyn ArtifactStore>, persist_budget: Duration, max_per_target: usize) -> Self {
        Self {
            queues: Mutex::new(BTreeMap::new()),
            store,
            persist_budget,
            max_per_target,
        }
    }

    /// Normalize one raw inbound event and append it to its target's queue.
    ///
    /// Attachment persistence happens synchronously here but is bounded; on
    /// timeout or failure the message is still enqueued, with no artifact
    /// path and an error kind, rather than dropped.
    pub fn ingest(&self, event: RawInboundEvent) {
        let target = normalize_target_name(&event.chat_name);
        let mut kind = parse_kind(&event.kind);
        let mut content = event.content.clone();
        let mut artifact_path = None;

        if let Some(artifact) = &event.attachment {
            match self.store.persist(&target, artifact, self.persist_budget) {
                Ok(path) => artifact_path = Some(path),
                Err(ArtifactError::TimedOut) => {
                    warn!(target = %target, name = %artifact.suggested_name,
                        "attachment persistence timed out");
                    kind = MessageKind::Error;
                    content = format!(
                        "attachment persistence timed out for '{}'",
                        artifact.suggested_name
                    );
                }
                Err(ArtifactError::Failed(detail)) => {
                    warn!(target = %target, name = %artifact.suggested_name, %detail,
                        "attachment persistence failed");
                    kind = MessageKind::Error;
                    content = format!(
                        "attachment persistence failed for '{}': {detail}",
                        artifact.suggested_name
                    );
                }
            }
        }

        let message = CachedMessage {
            target: target.clone(),
            kind,
            sender: event.sender,
            sender_remark: event.sender_remark,
            id: event.id,
            content,
            artifact_path,
            received_at: Utc::now(),
        };

        // Bodies are logged redacted only.
        let logged = redact_text(&message.content);

        let mut queues = self.queues.lock();
        let queue = queues.entry(target.clone()).or_default();
        queue.push_back(message);
        // Keep only the newest backlog per target.
        while queue.len() > self.max_per_target {
            queue.pop_front();
        }
        debug!(target = %target, pending = queue.len(), content = %logged, "message cached");
    }

    /// Pop and return pending messages.
    ///
    /// With a target: that target's whole queue (empty map if nothing
    /// pending). Without: exactly one target's backlog — the first non-empty
    /// queue in `preferred_order`, falling back to key order for any queue
    /// not listed there. Never a merged batch.
    pub fn drain(
        &self,
        target: Option<&str>,
        preferred_order: &[String],
    ) -> HashMap<String, Vec<CachedMessage>> {
        let mut queues = self.queues.lock();
        let mut out = HashMap::new();

        match target {
            Some(raw) => {
                let key = normalize_target_name(raw);
                if let Some(queue) = queues.get_mut(&key) {
                    if !queue.is_empty() {
                        out.insert(key, queue.drain(..).collect());
                    }
                }
            }
            None => {
                let chosen = preferred_order
                    .iter()
                    .find(|t| queues.get(*t).is_some_and(|q| !q.is_empty()))
                    .cloned()
                    .or_else(|| {
                        queues
                            .iter()
                            .find(|(_, q)| !q.is_empty())
                            .map(|(k, _)| k.clone())
                    });
                if let Some(key) = chosen {
                    if let Some(queue) = queues.get_mut(&key) {
                        out.insert(key, queue.drain(..).collect());
                    }
                }
            }
        }

        out
    }

    /// Discard everything pending for a target (watch removal).
    pub fn clear(&self, target: &str) {
        self.queues.lock().remove(&normalize_target_name(target));
    }

    pub fn pending(&self, target: &str) -> usize {
        self.queues
            .lock()
            .get(&normalize_target_name(target))
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn total_pending(&self) -> usize {
        self.queues.lock().values().map(|q| q.len()).sum()
    }
}
