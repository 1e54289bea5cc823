//! Driver doubles: a recording driver used across the test suites, and a
//! loopback driver that echoes sends back as inbound events for smoke runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use deskchat_types::Variant;

use crate::driver::{native, Driver, DriverError, NativeCall, RawInboundEvent};

/// One recorded invocation, with wall-clock bounds so tests can assert that
/// no two invocations overlapped.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub method: String,
    pub args: Map<String, Value>,
    pub started_at: Instant,
    pub finished_at: Instant,
}

#[derive(Default)]
struct FailureScript {
    always: HashMap<String, String>,
    /// method -> (remaining failures, detail)
    counted: HashMap<String, (u32, String)>,
}

pub struct RecordingDriver {
    variant: Variant,
    calls: Mutex<Vec<CallRecord>>,
    failures: Mutex<FailureScript>,
    /// Fuzzy open resolution: requested name -> what the client resolves to.
    resolutions: Mutex<HashMap<String, String>>,
    invoke_delay: Mutex<Duration>,
    event_tx: Mutex<Option<mpsc::UnboundedSender<RawInboundEvent>>>,
    window_label: Mutex<Option<String>>,
    in_flight: AtomicUsize,
    overlap_seen: AtomicBool,
    disconnects: AtomicUsize,
    dispatch_starts: AtomicUsize,
}

impl RecordingDriver {
    pub fn new(variant: Variant) -> Self {
        Self {
            variant,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(FailureScript::default()),
            resolutions: Mutex::new(HashMap::new()),
            invoke_delay: Mutex::new(Duration::ZERO),
            event_tx: Mutex::new(None),
            window_label: Mutex::new(Some("TestUser".to_string())),
            in_flight: AtomicUsize::new(0),
            overlap_seen: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
            dispatch_starts: AtomicUsize::new(0),
        }
    }

    /// Every future call of `method` fails with `detail`.
    pub fn fail_always(&self, method: &str, detail: &str) {
        self.failures
            .lock()
            .always
            .insert(method.to_string(), detail.to_string());
    }

    /// The next `n` calls of `method` fail with `detail`, then succeed.
    pub fn fail_times(&self, method: &str, n: u32, detail: &str) {
        self.failures
            .lock()
            .counted
            .insert(method.to_string(), (n, detail.to_string()));
    }

    pub fn clear_failures(&self) {
        *self.failures.lock() = FailureScript::default();
    }

    /// Make opens of `requested` resolve to `resolved` (fuzzy match).
    pub fn resolve_open(&self, requested: &str, resolved: &str) {
        self.resolutions
            .lock()
            .insert(requested.to_string(), resolved.to_string());
    }

    /// Delay every invocation, so overlap detection has teeth.
    pub fn set_invoke_delay(&self, delay: Duration) {
        *self.invoke_delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.method == method).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// True if any two invocations were ever in flight at the same time.
    pub fn overlap_seen(&self) -> bool {
        self.overlap_seen.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatch_starts.load(Ordering::SeqCst)
    }

    /// Deliver an inbound event as the native dispatch loop would. Returns
    /// false if the dispatch loop was never started.
    pub fn push_inbound(&self, event: RawInboundEvent) -> bool {
        match self.event_tx.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn scripted_failure(&self, method: &str) -> Option<String> {
        let mut failures = self.failures.lock();
        if let Some((remaining, detail)) = failures.counted.get_mut(method) {
            if *remaining > 0 {
                *remaining -= 1;
                return Some(detail.clone());
            }
        }
        failures.always.get(method).cloned()
    }

    fn respond(&self, call: &NativeCall) -> Value {
        match call.method {
            native::CHAT_WITH => {
                let who = call
                    .args
                    .get("who")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let resolved = self
                    .resolutions
                    .lock()
                    .get(who)
                    .cloned()
                    .unwrap_or_else(|| who.to_string());
                json!(resolved)
            }
            native::GET_SESSION_LIST => json!(["File Transfer"]),
            native::GET_NEXT_NEW_MESSAGE => json!({}),
            _ => json!(true),
        }
    }
}

#[async_trait]
impl Driver for RecordingDriver {
    fn variant(&self) -> Variant {
        self.variant
    }

    async fn connect(&self) -> Result<(), DriverError> {
        if let Some(detail) = self.scripted_failure("connect") {
            return Err(DriverError::new(detail));
        }
        Ok(())
    }

    async fn invoke(&self, call: NativeCall) -> Result<Value, DriverError> {
        let started_at = Instant::now();
        if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlap_seen.store(true, Ordering::SeqCst);
        }

        let delay = *self.invoke_delay.lock();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let outcome = match self.scripted_failure(call.method) {
            Some(detail) => Err(DriverError::new(detail)),
            None => Ok(self.respond(&call)),
        };

        self.calls.lock().push(CallRecord {
            method: call.method.to_string(),
            args: call.args,
            started_at,
            finished_at: Instant::now(),
        });
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn start_dispatch(
        &self,
        tx: mpsc::UnboundedSender<RawInboundEvent>,
    ) -> Result<(), DriverError> {
        if let Some(detail) = self.scripted_failure("StartListening") {
            return Err(DriverError::new(detail));
        }
        self.dispatch_starts.fetch_add(1, Ordering::SeqCst);
        *self.event_tx.lock() = Some(tx);
        Ok(())
    }

    async fn window_label(&self) -> Option<String> {
        self.window_label.lock().clone()
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        *self.event_tx.lock() = None;
    }
}

/// Build a plain text inbound event.
pub fn text_event(chat: &str, sender: &str, content: &str) -> RawInboundEvent {
    RawInboundEvent {
        chat_name: chat.to_string(),
        kind: "text".to_string(),
        sender: sender.to_string(),
        sender_remark: None,
        id: Uuid::new_v4().to_string(),
        content: content.to_string(),
        attachment: None,
    }
}

/// A driver for smoke runs without a real desktop client: behaves like the
/// recording driver, and additionally echoes every sent message back as an
/// inbound event from the same conversation.
pub struct LoopbackDriver {
    inner: RecordingDriver,
}

impl LoopbackDriver {
    pub fn new(variant: Variant) -> Self {
        Self {
            inner: RecordingDriver::new(variant),
        }
    }
}

#[async_trait]
impl Driver for LoopbackDriver {
    fn variant(&self) -> Variant {
        self.inner.variant()
    }

    async fn connect(&self) -> Result<(), DriverError> {
        self.inner.connect().await
    }

    async fn invoke(&self, call: NativeCall) -> Result<Value, DriverError> {
        let echo = if matches!(call.method, native::SEND_MSG | native::SEND_TYPING_TEXT) {
            let who = call
                .args
                .get("who")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let msg = call
                .args
                .get("msg")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some((who, msg))
        } else {
            None
        };

        let result = self.inner.invoke(call).await?;
        if let Some((who, msg)) = echo {
            self.inner
                .push_inbound(text_event(&who, &who, &format!("echo: {msg}")));
        }
        Ok(result)
    }

    async fn start_dispatch(
        &self,
        tx: mpsc::UnboundedSender<RawInboundEvent>,
    ) -> Result<(), DriverError> {
        self.inner.start_dispatch(tx).await
    }

    async fn window_label(&self) -> Option<String> {
        self.inner.window_label().await
    }

    async fn disconnect(&self) {
        self.inner.disconnect().await;
    }
}
