//! The one live backend session.
//!
//! Exactly one `BackendSession` exists at a time; it is the process-wide unit
//! of connected/disconnected state. It is never partially repaired — on any
//! unrecoverable failure the whole session is torn down and replaced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use deskchat_types::{BridgeError, Variant};

use crate::driver::{native, Driver, DriverError, NativeCall, RawInboundEvent};

pub struct BackendSession {
    variant: Variant,
    driver: Arc<dyn Driver>,
    initialized_at: DateTime<Utc>,
    /// Last known good window label; a fresh probe can fail while the cached
    /// value is still the best answer we have.
    window_label: Mutex<Option<String>>,
    dispatch_started: AtomicBool,
    torn_down: AtomicBool,
}

impl BackendSession {
    /// Acquire the automation handle and bring the session up.
    ///
    /// Warmup (opening the default fallback conversation so the client is in
    /// a known-good window state) is best-effort: failure is logged, never
    /// fatal.
    pub async fn initialize(
        driver: Arc<dyn Driver>,
        warmup_target: &str,
        warmup_delay: Duration,
    ) -> Result<Self, BridgeError> {
        let variant = driver.variant();
        driver.connect().await.map_err(|e| BridgeError::Backend {
            op: "connect".into(),
            detail: e.detail,
        })?;

        let label = driver.window_label().await;
        info!(
            variant = variant.as_str(),
            window = label.as_deref().unwrap_or(""),
            "backend session initialized"
        );

        let session = Self {
            variant,
            driver,
            initialized_at: Utc::now(),
            window_label: Mutex::new(label),
            dispatch_started: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        };

        if !warmup_target.is_empty() {
            let mut args = Map::new();
            args.insert("who".into(), Value::String(warmup_target.into()));
            match session.invoke(NativeCall::new(native::CHAT_WITH, args)).await {
                Ok(_) => {
                    tokio::time::sleep(warmup_delay).await;
                    debug!(target = warmup_target, "warmup conversation opened");
                }
                Err(e) => warn!(target = warmup_target, error = %e, "warmup open failed"),
            }
        }

        Ok(session)
    }

    pub fn variant(&self) -> Variant {
        self.variant
    }

    pub fn initialized_at(&self) -> DateTime<Utc> {
        self.initialized_at
    }

    /// Cached window label, if any probe ever succeeded.
    pub fn window_label(&self) -> Option<String> {
        self.window_label.lock().clone()
    }

    /// Probe the driver for a fresh label, falling back to the cache.
    pub async fn refresh_window_label(&self) -> Option<String> {
        if let Some(label) = self.driver.window_label().await {
            *self.window_label.lock() = Some(label.clone());
            return Some(label);
        }
        self.window_label.lock().clone()
    }

    /// Forward one native call. Any failure from the native layer is wrapped
    /// as a `Backend` error carrying the method name; no raw exception shape
    /// propagates.
    pub async fn invoke(&self, call: NativeCall) -> Result<Value, BridgeError> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(BridgeError::NotInitialized);
        }
        let method = call.method;
        self.driver
            .invoke(call)
            .await
            .map_err(|DriverError { detail }| BridgeError::Backend {
                op: method.to_string(),
                detail,
            })
    }

    /// Cheap read-only liveness probe. False on any error.
    pub async fn is_alive(&self) -> bool {
        if self.torn_down.load(Ordering::SeqCst) {
            return false;
        }
        match self
            .invoke(NativeCall::new(native::GET_SESSION_LIST, Map::new()))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "liveness probe failed");
                false
            }
        }
    }

    /// Start the single backend-level dispatch loop. Idempotent: the second
    /// and later calls are no-ops.
    pub async fn ensure_dispatch(
        &self,
        tx: mpsc::UnboundedSender<RawInboundEvent>,
    ) -> Result<(), BridgeError> {
        if self
            .dispatch_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        self.driver.start_dispatch(tx).await.map_err(|e| {
            self.dispatch_started.store(false, Ordering::SeqCst);
            BridgeError::Backend {
                op: "StartListening".into(),
                detail: e.detail,
            }
        })
    }

    /// Release the handle. Safe to call on an already-torn-down session.
    pub async fn teardown(&self) {
        if self
            .torn_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.driver.disconnect().await;
            info!(variant = self.variant.as_str(), "backend session torn down");
        }
    }
}
