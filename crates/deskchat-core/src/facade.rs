//! Uniform adapter facade over the live backend session.
//!
//! Every outbound operation goes through here: acquire the single session
//! lock (bounded wait), translate through the capability shim, invoke, and
//! normalize the failure shape. Holding the lock across the whole invoke is
//! what guarantees native calls never overlap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use deskchat_backend::{BackendSession, CapabilityShim};
use deskchat_observability::redact_text;
use deskchat_types::{
    matches_stale_signature, normalize_target_name, BridgeError, CachedMessage, MessageKind, Op,
    Variant, WatchOptions,
};

use crate::cache::parse_kind;

/// Holder of the one live session. The tokio mutex is the serialization
/// point for every native call; `marked_dead` is flipped by the monitor when
/// reconnection gives up, so callers fail fast instead of queueing on a
/// corpse.
pub struct SessionSlot {
    session: Mutex<Option<Arc<BackendSession>>>,
    marked_dead: AtomicBool,
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSlot {
    pub fn new() -> Self {
        Self {
            session: Mutex::new(None),
            marked_dead: AtomicBool::new(false),
        }
    }

    /// Bounded lock acquisition; callers never block forever behind a wedged
    /// native call.
    pub async fn lock_within(
        &self,
        wait: Duration,
    ) -> Result<MutexGuard<'_, Option<Arc<BackendSession>>>, BridgeError> {
        tokio::time::timeout(wait, self.session.lock())
            .await
            .map_err(|_| BridgeError::Timeout {
                detail: format!("session lock not acquired within {}ms", wait.as_millis()),
            })
    }

    pub async fn install(&self, session: Arc<BackendSession>) {
        *self.session.lock().await = Some(session);
        self.marked_dead.store(false, Ordering::SeqCst);
    }

    pub async fn take(&self) -> Option<Arc<BackendSession>> {
        self.session.lock().await.take()
    }

    pub async fn is_installed(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub fn mark_dead(&self) {
        self.marked_dead.store(true, Ordering::SeqCst);
    }

    pub fn clear_dead(&self) {
        self.marked_dead.store(false, Ordering::SeqCst);
    }

    pub fn is_marked_dead(&self) -> bool {
        self.marked_dead.load(Ordering::SeqCst)
    }
}

/// One backlog of normalized messages for a single conversation, as returned
/// by the native poll.
#[derive(Debug, Clone)]
pub struct NormalizedBatch {
    pub chat_name: String,
    pub messages: Vec<CachedMessage>,
}

pub struct AdapterFacade {
    shim: CapabilityShim,
    slot: Arc<SessionSlot>,
    lock_wait: Duration,
}

impl AdapterFacade {
    pub fn new(variant: Variant, slot: Arc<SessionSlot>, lock_wait: Duration) -> Self {
        Self {
            shim: CapabilityShim::new(variant),
            slot,
            lock_wait,
        }
    }

    pub fn variant(&self) -> Variant {
        self.shim.variant()
    }

    pub fn slot(&self) -> &Arc<SessionSlot> {
        &self.slot
    }

    pub fn supports(&self, op: Op) -> bool {
        self.shim.supports(op)
    }

    fn session_from<'a>(
        &self,
        guard: &'a MutexGuard<'_, Option<Arc<BackendSession>>>,
    ) -> Result<&'a Arc<BackendSession>, BridgeError> {
        if self.slot.is_marked_dead() {
            return Err(BridgeError::BackendUnavailable);
        }
        guard.as_ref().ok_or(BridgeError::NotInitialized)
    }

    /// Collapse raw backend failures whose detail carries a known stale
    /// window signature into `StaleHandle`, attributed to `target`.
    fn normalize_failure(target: &str, err: BridgeError) -> BridgeError {
        match err {
            BridgeError::Backend { op, detail } if matches_stale_signature(&detail) => {
                debug!(target = %target, %op, %detail, "stale handle signature matched");
                BridgeError::StaleHandle {
                    target: target.to_string(),
                    detail,
                }
            }
            other => other,
        }
    }

    async fn call_locked(
        &self,
        target: &str,
        op: Op,
        args: Map<String, Value>,
    ) -> Result<Value, BridgeError> {
        let guard = self.slot.lock_within(self.lock_wait).await?;
        let session = self.session_from(&guard)?;
        self.shim
            .call(session, op, args)
            .await
            .map_err(|e| Self::normalize_failure(target, e))
    }

    /// Open a conversation and return the name the client actually resolved
    /// it to (fuzzy matching means this can differ from the request).
    pub async fn open_conversation(&self, who: &str, exact: bool) -> Result<String, BridgeError> {
        let mut args = Map::new();
        args.insert("who".into(), Value::String(who.to_string()));
        args.insert("exact".into(), Value::Bool(exact));
        let resolved = self.call_locked(who, Op::Open, args).await?;
        Ok(resolved
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| who.to_string()))
    }

    /// Open and insist the resolution matches the request (modulo the group
    /// member-count suffix). A mismatch fails before anything is sent.
    pub async fn open_verified(&self, who: &str) -> Result<String, BridgeError> {
        let resolved = self.open_conversation(who, true).await?;
        if normalize_target_name(&resolved) != normalize_target_name(who) {
            return Err(BridgeError::TargetUnresolved {
                requested: who.to_string(),
                resolved,
            });
        }
        Ok(resolved)
    }

    /// Send text to a conversation. The open, the resolution check, and the
    /// send happen under one lock hold, so no other native call can slip in
    /// between focusing the window and typing into it.
    pub async fn send_text(
        &self,
        who: &str,
        text: &str,
        clear: bool,
        mentions: &[String],
    ) -> Result<(), BridgeError> {
        self.send_inner(Op::SendText, who, text, clear, mentions).await
    }

    /// Typing-simulation variant of `send_text`; unsupported variants fail
    /// before the session is touched.
    pub async fn send_typing(
        &self,
        who: &str,
        text: &str,
        clear: bool,
        mentions: &[String],
    ) -> Result<(), BridgeError> {
        if !self.shim.supports(Op::SendTyping) {
            return Err(BridgeError::UnsupportedOperation {
                op: Op::SendTyping,
                variant: self.shim.variant(),
            });
        }
        self.send_inner(Op::SendTyping, who, text, clear, mentions).await
    }

    async fn send_inner(
        &self,
        op: Op,
        who: &str,
        text: &str,
        clear: bool,
        mentions: &[String],
    ) -> Result<(), BridgeError> {
        let guard = self.slot.lock_within(self.lock_wait).await?;
        let session = self.session_from(&guard)?;

        let mut open_args = Map::new();
        open_args.insert("who".into(), Value::String(who.to_string()));
        open_args.insert("exact".into(), Value::Bool(true));
        let resolved = self
            .shim
            .call(session, Op::Open, open_args)
            .await
            .map_err(|e| Self::normalize_failure(who, e))?;
        let resolved = resolved
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| who.to_string());
        if normalize_target_name(&resolved) != normalize_target_name(who) {
            return Err(BridgeError::TargetUnresolved {
                requested: who.to_string(),
                resolved,
            });
        }

        let mut args = Map::new();
        args.insert("who".into(), Value::String(who.to_string()));
        args.insert("text".into(), Value::String(text.to_string()));
        args.insert("clear".into(), Value::Bool(clear));
        if !mentions.is_empty() {
            args.insert(
                "mentions".into(),
                Value::Array(mentions.iter().cloned().map(Value::String).collect()),
            );
        }
        self.shim
            .call(session, op, args)
            .await
            .map_err(|e| Self::normalize_failure(who, e))?;
        debug!(target = %who, op = op.as_str(), text = %redact_text(text), "outbound delivered");
        Ok(())
    }

    /// Send a local file. The path is checked before any window is touched.
    pub async fn send_attachment(&self, who: &str, path: &str) -> Result<(), BridgeError> {
        if !std::path::Path::new(path).is_file() {
            return Err(BridgeError::ArtifactNotFound {
                path: path.to_string(),
            });
        }

        let guard = self.slot.lock_within(self.lock_wait).await?;
        let session = self.session_from(&guard)?;

        let mut open_args = Map::new();
        open_args.insert("who".into(), Value::String(who.to_string()));
        open_args.insert("exact".into(), Value::Bool(true));
        let resolved = self
            .shim
            .call(session, Op::Open, open_args)
            .await
            .map_err(|e| Self::normalize_failure(who, e))?;
        let resolved = resolved
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| who.to_string());
        if normalize_target_name(&resolved) != normalize_target_name(who) {
            return Err(BridgeError::TargetUnresolved {
                requested: who.to_string(),
                resolved,
            });
        }

        let mut args = Map::new();
        args.insert("who".into(), Value::String(who.to_string()));
        args.insert("filepath".into(), Value::String(path.to_string()));
        self.shim
            .call(session, Op::SendAttachment, args)
            .await
            .map_err(|e| Self::normalize_failure(who, e))?;
        Ok(())
    }

    /// Register `target` with the native listener.
    pub async fn add_watch_native(
        &self,
        target: &str,
        options: &WatchOptions,
    ) -> Result<(), BridgeError> {
        let mut args = options_args(options);
        args.insert("who".into(), Value::String(target.to_string()));
        self.call_locked(target, Op::AddWatch, args).await?;
        Ok(())
    }

    /// Unregister `target` from the native listener.
    pub async fn remove_watch_native(&self, target: &str) -> Result<(), BridgeError> {
        let mut args = Map::new();
        args.insert("who".into(), Value::String(target.to_string()));
        self.call_locked(target, Op::RemoveWatch, args).await?;
        Ok(())
    }

    /// Ask the backend for the next unread backlog, normalized. `None` when
    /// nothing is pending.
    pub async fn poll_next(
        &self,
        options: &WatchOptions,
    ) -> Result<Option<NormalizedBatch>, BridgeError> {
        let args = options_args(options);
        let raw = self.call_locked("", Op::PollNext, args).await?;
        Ok(parse_poll_batch(&raw))
    }

    pub async fn ensure_dispatch(
        &self,
        tx: tokio::sync::mpsc::UnboundedSender<deskchat_backend::RawInboundEvent>,
    ) -> Result<(), BridgeError> {
        let guard = self.slot.lock_within(self.lock_wait).await?;
        let session = self.session_from(&guard)?;
        session.ensure_dispatch(tx).await
    }

    pub async fn window_label(&self) -> Option<String> {
        let guard = self.slot.lock_within(self.lock_wait).await.ok()?;
        let session = guard.as_ref()?;
        session.refresh_window_label().await
    }
}

fn options_args(options: &WatchOptions) -> Map<String, Value> {
    let mut args = Map::new();
    args.insert("save_images".into(), Value::Bool(options.save_images));
    args.insert("save_files".into(), Value::Bool(options.save_files));
    args.insert("save_voice".into(), Value::Bool(options.save_voice));
    args.insert("save_video".into(), Value::Bool(options.save_video));
    args.insert("parse_links".into(), Value::Bool(options.parse_links));
    args
}

/// Parse one native poll response. Empty object or missing message list
/// means no backlog.
fn parse_poll_batch(raw: &Value) -> Option<NormalizedBatch> {
    let obj = raw.as_object()?;
    if obj.is_empty() {
        return None;
    }
    let chat_name = obj
        .get("chat")
        .or_else(|| obj.get("chat_name"))
        .and_then(|v| v.as_str())?;
    let target = normalize_target_name(chat_name);

    let raw_messages = obj.get("msg").and_then(|v| v.as_array())?;
    let messages: Vec<CachedMessage> = raw_messages
        .iter()
        .filter_map(|m| {
            let m = m.as_object()?;
            Some(CachedMessage {
                target: target.clone(),
                kind: m
                    .get("type")
                    .and_then(|v| v.as_str())
                    .map(parse_kind)
                    .unwrap_or(MessageKind::Text),
                sender: m
                    .get("sender")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                sender_remark: m
                    .get("sender_remark")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                id: m
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                content: m
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                artifact_path: m
                    .get("file_path")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                received_at: chrono::Utc::now(),
            })
        })
        .collect();

    if messages.is_empty() {
        return None;
    }
    Some(NormalizedBatch {
        chat_name: target,
        messages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskchat_backend::mock::RecordingDriver;
    use deskchat_backend::native;
    use serde_json::json;

    async fn facade_with_driver(variant: Variant) -> (AdapterFacade, Arc<RecordingDriver>) {
        let driver = Arc::new(RecordingDriver::new(variant));
        let session = BackendSession::initialize(driver.clone(), "", Duration::ZERO)
            .await
            .unwrap();
        let slot = Arc::new(SessionSlot::new());
        slot.install(Arc::new(session)).await;
        (
            AdapterFacade::new(variant, slot, Duration::from_secs(5)),
            driver,
        )
    }

    #[tokio::test]
    async fn send_text_opens_then_sends_under_one_lock() {
        let (facade, driver) = facade_with_driver(Variant::Standard).await;
        facade.send_text("Alice", "hi", true, &[]).await.unwrap();

        let calls = driver.calls();
        assert_eq!(calls[0].method, native::CHAT_WITH);
        assert_eq!(calls[1].method, native::SEND_MSG);
        assert_eq!(calls[1].args["msg"], json!("hi"));
        assert!(!driver.overlap_seen());
    }

    #[tokio::test]
    async fn mismatched_resolution_issues_no_send() {
        let (facade, driver) = facade_with_driver(Variant::Plus).await;
        driver.resolve_open("Alice", "Alicia");

        let err = facade.send_text("Alice", "hi", true, &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::TargetUnresolved { .. }));
        assert_eq!(driver.call_count(native::SEND_MSG), 0);
    }

    #[tokio::test]
    async fn group_suffix_resolution_is_accepted() {
        let (facade, driver) = facade_with_driver(Variant::Plus).await;
        driver.resolve_open("Team", "Team (31)");

        facade.send_text("Team", "hi", true, &[]).await.unwrap();
        assert_eq!(driver.call_count(native::SEND_MSG), 1);
    }

    #[tokio::test]
    async fn send_typing_is_rejected_without_touching_session() {
        let (facade, driver) = facade_with_driver(Variant::Standard).await;
        let err = facade.send_typing("Alice", "hi", true, &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedOperation { .. }));
        assert_eq!(driver.total_calls(), 0);
    }

    #[tokio::test]
    async fn missing_attachment_fails_before_any_native_call() {
        let (facade, driver) = facade_with_driver(Variant::Standard).await;
        let err = facade
            .send_attachment("Alice", "/nonexistent/report.pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ArtifactNotFound { .. }));
        assert_eq!(driver.total_calls(), 0);
    }

    #[tokio::test]
    async fn attachment_goes_out_when_the_file_exists() {
        let (facade, driver) = facade_with_driver(Variant::Plus).await;
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().display().to_string();

        facade.send_attachment("Alice", &path).await.unwrap();
        assert_eq!(driver.call_count(native::SEND_FILES), 1);
    }

    #[tokio::test]
    async fn stale_signature_is_normalized() {
        let (facade, driver) = facade_with_driver(Variant::Standard).await;
        driver.fail_always(native::CHAT_WITH, "SetWindowPos failed with code 5");

        let err = facade.open_conversation("Alice", true).await.unwrap_err();
        match err {
            BridgeError::StaleHandle { target, .. } => assert_eq!(target, "Alice"),
            other => panic!("expected StaleHandle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_stale_backend_errors_pass_through() {
        let (facade, driver) = facade_with_driver(Variant::Standard).await;
        driver.fail_always(native::CHAT_WITH, "network unreachable");

        let err = facade.open_conversation("Alice", true).await.unwrap_err();
        assert!(matches!(err, BridgeError::Backend { .. }));
    }

    #[tokio::test]
    async fn empty_slot_reports_not_initialized() {
        let slot = Arc::new(SessionSlot::new());
        let facade = AdapterFacade::new(Variant::Standard, slot, Duration::from_secs(1));
        let err = facade.open_conversation("Alice", true).await.unwrap_err();
        assert!(matches!(err, BridgeError::NotInitialized));
    }

    #[tokio::test]
    async fn dead_slot_fails_fast() {
        let (facade, _driver) = facade_with_driver(Variant::Standard).await;
        facade.slot().mark_dead();
        let err = facade.open_conversation("Alice", true).await.unwrap_err();
        assert!(matches!(err, BridgeError::BackendUnavailable));
    }

    #[test]
    fn poll_batch_parses_native_shape() {
        let raw = json!({
            "chat": "Team (12)",
            "msg": [
                {"type": "friend", "sender": "bob", "content": "hi", "id": "m1"},
                {"type": "image", "sender": "amy", "content": "[img]", "id": "m2",
                 "file_path": "/tmp/a.jpg"},
            ]
        });
        let batch = parse_poll_batch(&raw).unwrap();
        assert_eq!(batch.chat_name, "Team");
        assert_eq!(batch.messages.len(), 2);
        assert_eq!(batch.messages[0].kind, MessageKind::Text);
        assert_eq!(batch.messages[1].kind, MessageKind::Image);
        assert_eq!(batch.messages[1].artifact_path.as_deref(), Some("/tmp/a.jpg"));
    }

    #[test]
    fn empty_poll_is_none() {
        assert!(parse_poll_batch(&json!({})).is_none());
        assert!(parse_poll_batch(&json!({"chat": "Team", "msg": []})).is_none());
    }
}
