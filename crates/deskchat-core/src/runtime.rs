//! Bridge runtime: wires the facade, registry, cache, recovery controller,
//! and connection monitor together and routes uniform operations.
//!
//! The runtime owns the retry policy around stale handles:
//! watch-path operations are retried once after a successful reactivation
//! cycle, send-path operations are never replayed (a send that half-landed
//! must not be duplicated) — recovery still runs so the next call finds a
//! live window.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn, Level};

use deskchat_backend::{BackendSession, RawInboundEvent};
use deskchat_observability::{emit_event, ObservabilityEvent};
use deskchat_types::{BridgeError, BridgeResponse, ListenTarget, Op, WatchOptions};

use crate::cache::{FsArtifactStore, MessageCache};
use crate::config::BridgeConfig;
use crate::facade::{AdapterFacade, SessionSlot};
use crate::monitor::{ConnectionMonitor, DriverFactory, MonitorStatus, ProbeOutcome};
use crate::recovery::RecoveryController;
use crate::registry::ListenRegistry;

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct OpenRequest {
    target: String,
    #[serde(default = "default_true")]
    exact: bool,
}

#[derive(Debug, Deserialize)]
struct SendTextRequest {
    target: String,
    text: String,
    #[serde(default = "default_true")]
    clear: bool,
    #[serde(default)]
    mentions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SendAttachmentRequest {
    target: String,
    path: String,
}

#[derive(Debug, Deserialize)]
struct AddWatchRequest {
    target: String,
    #[serde(default)]
    options: WatchOptions,
}

#[derive(Debug, Deserialize)]
struct RemoveWatchRequest {
    target: String,
}

#[derive(Debug, Default, Deserialize)]
struct DrainRequest {
    #[serde(default)]
    target: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PollNextRequest {
    #[serde(default)]
    options: WatchOptions,
}

/// Snapshot returned by `getStatus`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub initialized: bool,
    pub connected: bool,
    pub variant: String,
    pub window_label: Option<String>,
    pub watched: Vec<ListenTarget>,
    pub pending_messages: usize,
    pub monitor: MonitorSummary,
}

#[derive(Debug, Serialize)]
pub struct MonitorSummary {
    pub last_probe_at: Option<chrono::DateTime<chrono::Utc>>,
    pub consecutive_failures: u32,
    pub reinit_attempts: u32,
}

impl From<MonitorStatus> for MonitorSummary {
    fn from(status: MonitorStatus) -> Self {
        Self {
            last_probe_at: status.last_probe_at,
            consecutive_failures: status.consecutive_failures,
            reinit_attempts: status.reinit_attempts,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct BridgeRuntime {
    config: BridgeConfig,
    slot: Arc<SessionSlot>,
    facade: AdapterFacade,
    registry: Arc<ListenRegistry>,
    cache: Arc<MessageCache>,
    recovery: RecoveryController,
    monitor: ConnectionMonitor,
    factory: DriverFactory,
    ingest_tx: mpsc::UnboundedSender<RawInboundEvent>,
    ingest_task: JoinHandle<()>,
}

impl BridgeRuntime {
    /// Build the runtime and start the ingest task. Must run inside a tokio
    /// runtime; the session itself comes up later via `initialize`.
    pub fn new(config: BridgeConfig, factory: DriverFactory) -> Arc<Self> {
        let slot = Arc::new(SessionSlot::new());
        let facade = AdapterFacade::new(config.variant, slot.clone(), config.lock_wait);
        let registry = Arc::new(ListenRegistry::new());
        let cache = Arc::new(MessageCache::new(
            Box::new(FsArtifactStore::new(config.artifact_dir.clone())),
            config.persist_budget,
            config.cache_max_per_target,
        ));
        let recovery = RecoveryController::new(
            config.recovery_max_attempts,
            config.recovery_retry_delay,
            config.recovery_render_delay,
        );
        let monitor = ConnectionMonitor::new(slot.clone(), factory.clone(), &config);

        // The inbound path: dispatch callback -> channel -> cache. It never
        // touches the session lock.
        let (ingest_tx, mut ingest_rx) = mpsc::unbounded_channel::<RawInboundEvent>();
        let ingest_cache = cache.clone();
        let ingest_task = tokio::spawn(async move {
            while let Some(event) = ingest_rx.recv().await {
                ingest_cache.ingest(event);
            }
        });

        Arc::new(Self {
            config,
            slot,
            facade,
            registry,
            cache,
            recovery,
            monitor,
            factory,
            ingest_tx,
            ingest_task,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Bring the backend session up. Idempotent: a second call against a
    /// live session reports the existing one instead of rebuilding it.
    pub async fn initialize(&self) -> Result<Value, BridgeError> {
        {
            let mut guard = self.slot.lock_within(self.config.lock_wait).await?;
            if let Some(session) = guard.as_ref() {
                return Ok(json!({
                    "variant": self.config.variant.as_str(),
                    "window_label": session.window_label(),
                    "already_initialized": true,
                }));
            }

            let driver = (self.factory)(self.config.variant);
            let session = Arc::new(
                BackendSession::initialize(
                    driver,
                    &self.config.warmup_target,
                    self.config.warmup_delay,
                )
                .await?,
            );
            session.ensure_dispatch(self.ingest_tx.clone()).await?;
            *guard = Some(session);
            self.slot.clear_dead();
        }

        self.replay_watches().await;

        let label = self.facade.window_label().await;
        info!(
            variant = self.config.variant.as_str(),
            window = label.as_deref().unwrap_or(""),
            "bridge initialized"
        );
        Ok(json!({
            "variant": self.config.variant.as_str(),
            "window_label": label,
            "already_initialized": false,
        }))
    }

    /// Re-register every watched target with the (possibly rebuilt) native
    /// listener. Failures are logged per target, not fatal.
    async fn replay_watches(&self) {
        for target in self.registry.snapshot() {
            if let Err(e) = self
                .facade
                .add_watch_native(&target.target, &target.options)
                .await
            {
                warn!(target = %target.target, error = %e, "watch replay failed");
            }
        }
    }

    /// Periodic liveness loop. Aborted via the returned handle.
    pub fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(runtime.monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so a freshly started
            // bridge is not probed before initialize.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if runtime.monitor.probe_once().await == ProbeOutcome::Reinitialized {
                    if let Err(e) = runtime.facade.ensure_dispatch(runtime.ingest_tx.clone()).await
                    {
                        warn!(error = %e, "dispatch restart after rebuild failed");
                    }
                    runtime.replay_watches().await;
                }
            }
        })
    }

    pub async fn status(&self) -> StatusReport {
        let initialized = self.slot.is_installed().await;
        StatusReport {
            initialized,
            connected: initialized && !self.slot.is_marked_dead(),
            variant: self.config.variant.as_str().to_string(),
            window_label: if initialized {
                self.facade.window_label().await
            } else {
                None
            },
            watched: self.registry.snapshot(),
            pending_messages: self.cache.total_pending(),
            monitor: self.monitor.status().into(),
        }
    }

    /// Route one uniform operation and wrap the outcome into the response
    /// envelope.
    pub async fn handle(&self, op: Op, params: Value) -> BridgeResponse {
        match self.execute(op, params).await {
            Ok(data) => BridgeResponse::ok(data),
            Err(e) => {
                let kind = e.kind();
                let detail = e.to_string();
                emit_event(
                    Level::WARN,
                    ObservabilityEvent {
                        event: "operation_failed",
                        component: "runtime",
                        target: None,
                        op: Some(op.as_str()),
                        variant: Some(self.config.variant.as_str()),
                        status: Some("error"),
                        error_code: Some(&format!("{kind:?}")),
                        detail: Some(&detail),
                    },
                );
                BridgeResponse::err(kind, detail)
            }
        }
    }

    pub async fn execute(&self, op: Op, params: Value) -> Result<Value, BridgeError> {
        match op {
            Op::Open => {
                let req: OpenRequest = parse(params)?;
                let resolved = match self.facade.open_conversation(&req.target, req.exact).await {
                    Err(e) if e.is_stale() => {
                        self.recover(&req.target).await?;
                        self.facade.open_conversation(&req.target, req.exact).await?
                    }
                    other => other?,
                };
                Ok(json!({ "resolved": resolved }))
            }

            Op::SendText => {
                let req: SendTextRequest = parse(params)?;
                self.send_guarded(&req.target, || {
                    self.facade
                        .send_text(&req.target, &req.text, req.clear, &req.mentions)
                })
                .await
            }

            Op::SendTyping => {
                let req: SendTextRequest = parse(params)?;
                self.send_guarded(&req.target, || {
                    self.facade
                        .send_typing(&req.target, &req.text, req.clear, &req.mentions)
                })
                .await
            }

            Op::SendAttachment => {
                let req: SendAttachmentRequest = parse(params)?;
                self.send_guarded(&req.target, || {
                    self.facade.send_attachment(&req.target, &req.path)
                })
                .await
            }

            Op::AddWatch => {
                let req: AddWatchRequest = parse(params)?;
                // An already-watched target is a no-op: the existing options
                // stay and the native listener is not touched.
                if !self.registry.contains(&req.target) {
                    match self.add_watch_once(&req.target, req.options).await {
                        Err(e) if e.is_stale() => {
                            self.recover(&req.target).await?;
                            self.add_watch_once(&req.target, req.options).await?;
                        }
                        other => other?,
                    }
                }
                Ok(json!({ "watched": self.registry.order() }))
            }

            Op::RemoveWatch => {
                let req: RemoveWatchRequest = parse(params)?;
                if self.registry.contains(&req.target) {
                    // Native unregistration is best-effort; the registry and
                    // cache are the source of truth.
                    if let Err(e) = self.facade.remove_watch_native(&req.target).await {
                        warn!(target = %req.target, error = %e, "native unwatch failed");
                    }
                    self.registry.remove(&req.target);
                    self.cache.clear(&req.target);
                }
                Ok(json!({ "watched": self.registry.order() }))
            }

            Op::Drain => {
                let req: DrainRequest = parse_or_default(params)?;
                let drained = self
                    .cache
                    .drain(req.target.as_deref(), &self.registry.order());
                Ok(to_value(&drained))
            }

            Op::PollNext => {
                let req: PollNextRequest = parse_or_default(params)?;
                let batch = match self.facade.poll_next(&req.options).await {
                    Err(e) if e.is_stale() => {
                        // No single conversation to blame; cycle them all.
                        let failures = self
                            .recovery
                            .recover_all(&self.facade, &self.registry, &self.cache)
                            .await;
                        for (target, err) in &failures {
                            warn!(target = %target, error = %err, "recovery during poll failed");
                        }
                        self.facade.poll_next(&req.options).await?
                    }
                    other => other?,
                };
                match batch {
                    Some(batch) => Ok(json!({
                        "chat": batch.chat_name,
                        "messages": to_value(&batch.messages),
                    })),
                    None => Ok(json!({})),
                }
            }

            Op::GetStatus => Ok(to_value(&self.status().await)),
        }
    }

    async fn add_watch_once(
        &self,
        target: &str,
        options: WatchOptions,
    ) -> Result<(), BridgeError> {
        self.facade.open_verified(target).await?;
        self.facade.add_watch_native(target, &options).await?;
        self.facade.ensure_dispatch(self.ingest_tx.clone()).await?;
        self.registry.register(target, options);
        Ok(())
    }

    /// Send-path policy: on a stale failure run one reactivation cycle but
    /// never replay the send itself; the original error surfaces.
    async fn send_guarded<F, Fut>(&self, target: &str, send: F) -> Result<Value, BridgeError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), BridgeError>>,
    {
        match send().await {
            Ok(()) => Ok(json!({ "sent": true })),
            Err(e) if e.is_stale() => {
                self.recover(target).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn recover(&self, target: &str) -> Result<(), BridgeError> {
        self.recovery
            .recover_target(&self.facade, &self.registry, &self.cache, target)
            .await
    }

    /// Tear the session down and stop the ingest task.
    pub async fn shutdown(&self) {
        if let Some(session) = self.slot.take().await {
            session.teardown().await;
        }
        self.ingest_task.abort();
    }

    /// Drop only the live session, keeping the registry intact. The next
    /// `initialize` replays every watch.
    pub async fn drop_session(&self) {
        if let Some(session) = self.slot.take().await {
            session.teardown().await;
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, BridgeError> {
    serde_json::from_value(params).map_err(|e| BridgeError::InvalidRequest {
        detail: e.to_string(),
    })
}

fn parse_or_default<T: serde::de::DeserializeOwned + Default>(
    params: Value,
) -> Result<T, BridgeError> {
    if params.is_null() {
        return Ok(T::default());
    }
    parse(params)
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use deskchat_backend::mock::{text_event, RecordingDriver};
    use deskchat_backend::{native, Driver};
    use deskchat_types::{ErrorKind, Variant};

    async fn rig(variant: Variant) -> (Arc<BridgeRuntime>, Arc<RecordingDriver>) {
        let driver = Arc::new(RecordingDriver::new(variant));
        let shared = driver.clone();
        let factory: DriverFactory = Arc::new(move |_| shared.clone() as Arc<dyn Driver>);
        let config = BridgeConfig {
            variant,
            warmup_target: String::new(),
            warmup_delay: Duration::ZERO,
            recovery_retry_delay: Duration::ZERO,
            recovery_render_delay: Duration::ZERO,
            reconnect_delay: Duration::ZERO,
            artifact_dir: std::env::temp_dir().join("deskchat-test"),
            ..BridgeConfig::default()
        };
        let runtime = BridgeRuntime::new(config, factory);
        runtime.initialize().await.unwrap();
        (runtime, driver)
    }

    async fn drain_until_nonempty(runtime: &BridgeRuntime, target: &str) -> Value {
        for _ in 0..100 {
            let resp = runtime
                .handle(Op::Drain, json!({ "target": target }))
                .await;
            let data = resp.data.unwrap();
            if data.as_object().is_some_and(|m| !m.is_empty()) {
                return data;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no messages drained for {target}");
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let (runtime, driver) = rig(Variant::Standard).await;
        let connects_after_first = driver.total_calls();

        let second = runtime.initialize().await.unwrap();
        assert_eq!(second["already_initialized"], json!(true));
        assert_eq!(driver.total_calls(), connects_after_first);
    }

    #[tokio::test]
    async fn add_watch_registers_and_is_idempotent() {
        let (runtime, driver) = rig(Variant::Plus).await;

        for _ in 0..2 {
            let resp = runtime
                .handle(Op::AddWatch, json!({ "target": "Alice" }))
                .await;
            assert!(resp.ok);
            assert_eq!(resp.data.unwrap()["watched"], json!(["Alice"]));
        }
        // The second call is a pure no-op: no reopen, no re-registration.
        assert_eq!(driver.call_count(native::ADD_LISTEN_CHAT), 1);
        assert_eq!(driver.call_count(native::CHAT_WITH), 1);
        assert_eq!(driver.dispatch_count(), 1);
    }

    #[tokio::test]
    async fn remove_watch_is_idempotent_and_clears_backlog() {
        let (runtime, driver) = rig(Variant::Standard).await;
        runtime
            .handle(Op::AddWatch, json!({ "target": "Alice" }))
            .await;
        driver.push_inbound(text_event("Alice", "Alice", "pending"));

        let resp = runtime
            .handle(Op::RemoveWatch, json!({ "target": "Alice" }))
            .await;
        assert!(resp.ok);
        assert_eq!(driver.call_count(native::REMOVE_LISTEN_CHAT), 1);

        // Absent target: ok, and no further native call.
        let resp = runtime
            .handle(Op::RemoveWatch, json!({ "target": "Alice" }))
            .await;
        assert!(resp.ok);
        assert_eq!(driver.call_count(native::REMOVE_LISTEN_CHAT), 1);

        let drained = runtime.handle(Op::Drain, json!({ "target": "Alice" })).await;
        assert!(drained.data.unwrap().as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn inbound_events_flow_to_drain_exactly_once() {
        let (runtime, driver) = rig(Variant::Standard).await;
        runtime
            .handle(Op::AddWatch, json!({ "target": "Alice" }))
            .await;

        driver.push_inbound(text_event("Alice", "Alice", "first"));
        driver.push_inbound(text_event("Alice", "Alice", "second"));

        let data = drain_until_nonempty(&runtime, "Alice").await;
        let messages = data["Alice"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["content"], json!("first"));
        assert_eq!(messages[1]["content"], json!("second"));

        let resp = runtime.handle(Op::Drain, json!({ "target": "Alice" })).await;
        assert!(resp.data.unwrap().as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn untargeted_drain_returns_one_backlog_per_call() {
        let (runtime, driver) = rig(Variant::Standard).await;
        runtime.handle(Op::AddWatch, json!({ "target": "A" })).await;
        runtime.handle(Op::AddWatch, json!({ "target": "B" })).await;
        driver.push_inbound(text_event("A", "a", "1"));
        driver.push_inbound(text_event("B", "b", "2"));

        // Wait for ingest, then drain twice without a target.
        drain_until_nonempty(&runtime, "A").await;
        driver.push_inbound(text_event("A", "a", "3"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = runtime.handle(Op::Drain, Value::Null).await.data.unwrap();
        assert_eq!(first.as_object().unwrap().len(), 1);
        let second = runtime.handle(Op::Drain, Value::Null).await.data.unwrap();
        assert_eq!(second.as_object().unwrap().len(), 1);
        assert_ne!(
            first.as_object().unwrap().keys().next(),
            second.as_object().unwrap().keys().next()
        );
    }

    #[tokio::test]
    async fn send_typing_gap_is_surfaced_without_native_calls() {
        let (runtime, driver) = rig(Variant::Standard).await;
        let baseline = driver.total_calls();

        let resp = runtime
            .handle(Op::SendTyping, json!({ "target": "Alice", "text": "hi" }))
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.error_kind, Some(ErrorKind::UnsupportedOperation));
        assert_eq!(driver.total_calls(), baseline);
    }

    #[tokio::test]
    async fn mismatched_target_send_is_rejected() {
        let (runtime, driver) = rig(Variant::Plus).await;
        driver.resolve_open("Alice", "Alicia");

        let resp = runtime
            .handle(Op::SendText, json!({ "target": "Alice", "text": "hi" }))
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.error_kind, Some(ErrorKind::TargetUnresolved));
        assert_eq!(driver.call_count(native::SEND_MSG), 0);
    }

    #[tokio::test]
    async fn stale_send_recovers_once_but_never_replays() {
        let (runtime, driver) = rig(Variant::Standard).await;
        driver.fail_always(native::SEND_MSG, "invalid window handle");

        let resp = runtime
            .handle(Op::SendText, json!({ "target": "Alice", "text": "hi" }))
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.error_kind, Some(ErrorKind::StaleHandle));
        // One failed send, never retried; the cycle reopens and then checks
        // the window with a second open.
        assert_eq!(driver.call_count(native::SEND_MSG), 1);
        assert_eq!(driver.call_count(native::CHAT_WITH), 3);
    }

    #[tokio::test]
    async fn stale_add_watch_is_retried_after_recovery() {
        let (runtime, driver) = rig(Variant::Plus).await;
        driver.fail_times(native::ADD_LISTEN_CHAT, 1, "window not found");

        let resp = runtime
            .handle(Op::AddWatch, json!({ "target": "Alice" }))
            .await;
        assert!(resp.ok);
        assert_eq!(driver.call_count(native::ADD_LISTEN_CHAT), 2);
        assert!(runtime.registry.contains("Alice"));
    }

    #[tokio::test]
    async fn exhausted_recovery_drops_the_watch() {
        let (runtime, driver) = rig(Variant::Standard).await;
        runtime
            .handle(Op::AddWatch, json!({ "target": "Alice" }))
            .await;
        driver.fail_always(native::SEND_MSG, "invalid window handle");
        driver.fail_always(native::ADD_LISTEN_CHAT, "window activation failed");

        let resp = runtime
            .handle(Op::SendText, json!({ "target": "Alice", "text": "hi" }))
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.error_kind, Some(ErrorKind::RecoveryExhausted));
        assert!(!runtime.registry.contains("Alice"));
    }

    #[tokio::test]
    async fn concurrent_sends_never_overlap_native_calls() {
        let (runtime, driver) = rig(Variant::Standard).await;
        driver.set_invoke_delay(Duration::from_millis(10));

        let a = runtime.handle(Op::SendText, json!({ "target": "Alice", "text": "1" }));
        let b = runtime.handle(Op::SendText, json!({ "target": "Bob", "text": "2" }));
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra.ok && rb.ok);
        assert!(!driver.overlap_seen());
    }

    #[tokio::test]
    async fn watches_are_replayed_after_reinitialize() {
        let (runtime, driver) = rig(Variant::Standard).await;
        runtime
            .handle(Op::AddWatch, json!({ "target": "Alice" }))
            .await;
        let adds_before = driver.call_count(native::ADD_LISTEN_CHAT);

        runtime.drop_session().await;
        runtime.initialize().await.unwrap();

        assert_eq!(driver.call_count(native::ADD_LISTEN_CHAT), adds_before + 1);
        assert!(runtime.registry.contains("Alice"));
    }

    #[tokio::test]
    async fn status_reflects_session_and_watches() {
        let (runtime, _driver) = rig(Variant::Plus).await;
        runtime
            .handle(Op::AddWatch, json!({ "target": "Team (12)" }))
            .await;

        let status = runtime.status().await;
        assert!(status.initialized);
        assert!(status.connected);
        assert_eq!(status.variant, "plus");
        assert_eq!(status.watched.len(), 1);
        assert_eq!(status.watched[0].target, "Team");
    }

    #[tokio::test]
    async fn malformed_params_are_invalid_requests() {
        let (runtime, _driver) = rig(Variant::Standard).await;
        let resp = runtime.handle(Op::SendText, json!({ "text": "hi" })).await;
        assert!(!resp.ok);
        assert_eq!(resp.error_kind, Some(ErrorKind::InvalidRequest));
    }

    #[tokio::test]
    async fn uninitialized_runtime_rejects_operations() {
        let driver = Arc::new(RecordingDriver::new(Variant::Standard));
        let shared = driver.clone();
        let factory: DriverFactory = Arc::new(move |_| shared.clone() as Arc<dyn Driver>);
        let config = BridgeConfig {
            warmup_target: String::new(),
            ..BridgeConfig::default()
        };
        let runtime = BridgeRuntime::new(config, factory);

        let resp = runtime
            .handle(Op::Open, json!({ "target": "Alice" }))
            .await;
        assert!(!resp.ok);
        assert_eq!(resp.error_kind, Some(ErrorKind::NotInitialized));
    }
}
