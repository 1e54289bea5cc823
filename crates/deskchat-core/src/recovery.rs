//! Stale-handle recovery.
//!
//! When a native call fails with a known stale window signature, the cached
//! automation handle for that conversation is presumed invalid. The fix is a
//! reactivation cycle: drop the native listener registration, reopen the
//! conversation so the client rebuilds the window, wait for it to render,
//! register again, and confirm with a call against the target. The cycle is
//! bounded; exhaustion removes the target rather than looping forever
//! against a dead window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tracing::{info, warn, Level};

use deskchat_observability::{emit_event, ObservabilityEvent};
use deskchat_types::{normalize_target_name, BridgeError, WatchOptions};

use crate::cache::MessageCache;
use crate::facade::AdapterFacade;
use crate::registry::ListenRegistry;

/// Per-target recovery state. `Suspect` marks a target whose last operation
/// failed stale but whose cycle has not started yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetHealth {
    Healthy,
    Suspect,
    Recovering,
    Failed,
}

pub struct RecoveryController {
    /// One reactivation cycle at a time, process-wide. Concurrent stale
    /// failures against different targets queue here instead of interleaving
    /// window manipulation.
    cycle_guard: Mutex<()>,
    states: SyncMutex<HashMap<String, TargetHealth>>,
    max_attempts: u32,
    retry_delay: Duration,
    render_delay: Duration,
}

impl RecoveryController {
    pub fn new(max_attempts: u32, retry_delay: Duration, render_delay: Duration) -> Self {
        Self {
            cycle_guard: Mutex::new(()),
            states: SyncMutex::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
            retry_delay,
            render_delay,
        }
    }

    pub fn health(&self, target: &str) -> TargetHealth {
        self.states
            .lock()
            .get(&normalize_target_name(target))
            .copied()
            .unwrap_or(TargetHealth::Healthy)
    }

    fn set_health(&self, target: &str, health: TargetHealth) {
        self.states.lock().insert(target.to_string(), health);
    }

    /// Run the bounded reactivation cycle for one target.
    ///
    /// Watched targets get the full remove/reopen/re-add cycle; a target that
    /// is not watched (a send hit a stale window) only needs the reopen. On
    /// exhaustion a watched target is dropped from the registry and its
    /// pending backlog discarded, and `RecoveryExhausted` is returned.
    pub async fn recover_target(
        &self,
        facade: &AdapterFacade,
        registry: &Arc<ListenRegistry>,
        cache: &Arc<MessageCache>,
        target: &str,
    ) -> Result<(), BridgeError> {
        let key = normalize_target_name(target);
        self.set_health(&key, TargetHealth::Suspect);
        let _cycle = self.cycle_guard.lock().await;
        self.set_health(&key, TargetHealth::Recovering);

        let options = registry.options_for(&key);
        let mut last_err = None;

        for attempt in 1..=self.max_attempts {
            info!(target = %key, attempt, watched = options.is_some(), "reactivation cycle");
            match self.cycle(facade, &key, options).await {
                Ok(()) => {
                    self.set_health(&key, TargetHealth::Healthy);
                    registry.touch(&key);
                    emit_event(
                        Level::INFO,
                        ObservabilityEvent {
                            event: "recovery_succeeded",
                            component: "recovery",
                            target: Some(&key),
                            op: None,
                            variant: Some(facade.variant().as_str()),
                            status: Some("healthy"),
                            error_code: None,
                            detail: None,
                        },
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(target = %key, attempt, error = %e, "reactivation attempt failed");
                    last_err = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        self.set_health(&key, TargetHealth::Failed);
        if options.is_some() {
            registry.remove(&key);
            cache.clear(&key);
        }
        let detail = last_err.map(|e| e.to_string()).unwrap_or_default();
        emit_event(
            Level::ERROR,
            ObservabilityEvent {
                event: "recovery_exhausted",
                component: "recovery",
                target: Some(&key),
                op: None,
                variant: Some(facade.variant().as_str()),
                status: Some("failed"),
                error_code: Some("recovery_exhausted"),
                detail: Some(&detail),
            },
        );
        Err(BridgeError::RecoveryExhausted {
            target: key,
            attempts: self.max_attempts,
        })
    }

    async fn cycle(
        &self,
        facade: &AdapterFacade,
        target: &str,
        options: Option<WatchOptions>,
    ) -> Result<(), BridgeError> {
        if options.is_some() {
            // The registration may already be gone on the native side.
            if let Err(e) = facade.remove_watch_native(target).await {
                warn!(target = %target, error = %e, "pre-recovery unregister failed");
            }
        }

        // The reopen itself is best-effort; the check below decides whether
        // the window actually came back.
        if let Err(e) = facade.open_conversation(target, true).await {
            warn!(target = %target, error = %e, "reopen during recovery failed");
        }
        tokio::time::sleep(self.render_delay).await;

        if let Some(options) = options {
            facade.add_watch_native(target, &options).await?;
        }

        // A successful re-registration says nothing about the window state.
        // The attempt only counts once a call against the target goes through.
        facade.open_verified(target).await?;
        Ok(())
    }

    /// Recover every watched target, each with its own bounded cycle. Used
    /// when a failure cannot be attributed to one conversation. Returns the
    /// targets whose cycles exhausted.
    pub async fn recover_all(
        &self,
        facade: &AdapterFacade,
        registry: &Arc<ListenRegistry>,
        cache: &Arc<MessageCache>,
    ) -> Vec<(String, BridgeError)> {
        let mut failures = Vec::new();
        for target in registry.order() {
            if let Err(e) = self.recover_target(facade, registry, cache, &target).await {
                failures.push((target, e));
            }
        }
        failures
    }
}
