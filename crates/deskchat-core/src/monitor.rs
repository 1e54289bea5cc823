//! Session liveness monitoring and automatic reinitialization.
//!
//! A periodic probe asks the backend for its session list; any failure means
//! the automation handle is gone (client restarted, logged out, window
//! destroyed). The broken session is never repaired in place: it is torn
//! down and a fresh one is built, bounded by a retry budget. When the budget
//! runs out the slot is left empty and marked dead so every caller fails
//! fast until an explicit initialize.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{info, warn, Level};

use deskchat_backend::{BackendSession, Driver};
use deskchat_observability::{emit_event, ObservabilityEvent};
use deskchat_types::Variant;

use crate::config::BridgeConfig;
use crate::facade::SessionSlot;

/// Builds a fresh driver for (re)initialization.
pub type DriverFactory = Arc<dyn Fn(Variant) -> Arc<dyn Driver> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Alive,
    /// Session gone and no reconnect was attempted.
    Dead,
    Reinitialized,
    RetriesExhausted,
}

#[derive(Debug, Clone, Default)]
pub struct MonitorStatus {
    pub connected: bool,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub reinit_attempts: u32,
    pub last_outcome: Option<ProbeOutcome>,
}

pub struct ConnectionMonitor {
    slot: Arc<SessionSlot>,
    variant: Variant,
    factory: DriverFactory,
    status: Mutex<MonitorStatus>,

    lock_wait: Duration,
    auto_reconnect: bool,
    reconnect_delay: Duration,
    reconnect_max_retry: u32,
    warmup_target: String,
    warmup_delay: Duration,
    pub interval: Duration,
}

impl ConnectionMonitor {
    pub fn new(slot: Arc<SessionSlot>, factory: DriverFactory, config: &BridgeConfig) -> Self {
        Self {
            slot,
            variant: config.variant,
            factory,
            status: Mutex::new(MonitorStatus::default()),
            lock_wait: config.lock_wait,
            auto_reconnect: config.auto_reconnect,
            reconnect_delay: config.reconnect_delay,
            reconnect_max_retry: config.reconnect_max_retry,
            warmup_target: config.warmup_target.clone(),
            warmup_delay: config.warmup_delay,
            interval: config.monitor_interval,
        }
    }

    pub fn status(&self) -> MonitorStatus {
        self.status.lock().clone()
    }

    fn record(&self, outcome: ProbeOutcome, connected: bool) {
        let mut status = self.status.lock();
        status.connected = connected;
        status.last_probe_at = Some(Utc::now());
        status.last_outcome = Some(outcome);
        if connected {
            status.consecutive_failures = 0;
        } else {
            status.consecutive_failures += 1;
        }
    }

    /// One probe, with reconnection if the session turns out dead.
    ///
    /// Holds the session lock for the probe and for any rebuild, so no
    /// operation can race a half-replaced session. An empty slot is reported
    /// dead but never auto-rebuilt; bringing the bridge up is an explicit
    /// act.
    pub async fn probe_once(&self) -> ProbeOutcome {
        let mut guard = match self.slot.lock_within(self.lock_wait).await {
            Ok(guard) => guard,
            Err(_) => {
                // A wedged lock is not evidence the session is dead.
                warn!("liveness probe skipped: session lock busy");
                return self.status.lock().last_outcome.unwrap_or(ProbeOutcome::Dead);
            }
        };

        let Some(session) = guard.as_ref() else {
            self.record(ProbeOutcome::Dead, false);
            return ProbeOutcome::Dead;
        };

        if session.is_alive().await {
            self.record(ProbeOutcome::Alive, true);
            return ProbeOutcome::Alive;
        }

        warn!(variant = self.variant.as_str(), "liveness probe failed, tearing session down");
        session.teardown().await;
        *guard = None;

        if !self.auto_reconnect {
            self.slot.mark_dead();
            self.record(ProbeOutcome::Dead, false);
            return ProbeOutcome::Dead;
        }

        for attempt in 1..=self.reconnect_max_retry {
            self.status.lock().reinit_attempts += 1;
            info!(attempt, max = self.reconnect_max_retry, "rebuilding backend session");
            tokio::time::sleep(self.reconnect_delay).await;

            let driver = (self.factory)(self.variant);
            match BackendSession::initialize(driver, &self.warmup_target, self.warmup_delay).await {
                Ok(session) => {
                    *guard = Some(Arc::new(session));
                    self.slot.clear_dead();
                    self.record(ProbeOutcome::Reinitialized, true);
                    emit_event(
                        Level::INFO,
                        ObservabilityEvent {
                            event: "session_reinitialized",
                            component: "monitor",
                            target: None,
                            op: None,
                            variant: Some(self.variant.as_str()),
                            status: Some("connected"),
                            error_code: None,
                            detail: None,
                        },
                    );
                    return ProbeOutcome::Reinitialized;
                }
                Err(e) => warn!(attempt, error = %e, "session rebuild failed"),
            }
        }

        self.slot.mark_dead();
        self.record(ProbeOutcome::RetriesExhausted, false);
        emit_event(
            Level::ERROR,
            ObservabilityEvent {
                event: "session_rebuild_exhausted",
                component: "monitor",
                target: None,
                op: None,
                variant: Some(self.variant.as_str()),
                status: Some("disconnected"),
                error_code: Some("backend_unavailable"),
                detail: None,
            },
        );
        ProbeOutcome::RetriesExhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskchat_backend::mock::RecordingDriver;
    use deskchat_backend::native;

    fn config_fast() -> BridgeConfig {
        BridgeConfig {
            warmup_target: String::new(),
            warmup_delay: Duration::ZERO,
            reconnect_delay: Duration::ZERO,
            reconnect_max_retry: 2,
            ..BridgeConfig::default()
        }
    }

    async fn installed_slot(driver: Arc<RecordingDriver>) -> Arc<SessionSlot> {
        let session = BackendSession::initialize(driver, "", Duration::ZERO)
            .await
            .unwrap();
        let slot = Arc::new(SessionSlot::new());
        slot.install(Arc::new(session)).await;
        slot
    }

    #[tokio::test]
    async fn healthy_session_probes_alive() {
        let driver = Arc::new(RecordingDriver::new(Variant::Standard));
        let slot = installed_slot(driver.clone()).await;
        let factory: DriverFactory = Arc::new(move |_| driver.clone() as Arc<dyn Driver>);

        let monitor = ConnectionMonitor::new(slot, factory, &config_fast());
        assert_eq!(monitor.probe_once().await, ProbeOutcome::Alive);
        let status = monitor.status();
        assert!(status.connected);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn dead_session_is_rebuilt() {
        let dead = Arc::new(RecordingDriver::new(Variant::Standard));
        let slot = installed_slot(dead.clone()).await;
        dead.fail_always(native::GET_SESSION_LIST, "invalid window handle");

        let factory: DriverFactory =
            Arc::new(|variant| Arc::new(RecordingDriver::new(variant)) as Arc<dyn Driver>);
        let monitor = ConnectionMonitor::new(slot.clone(), factory, &config_fast());

        assert_eq!(monitor.probe_once().await, ProbeOutcome::Reinitialized);
        assert_eq!(dead.disconnect_count(), 1);
        assert!(slot.is_installed().await);
        assert!(!slot.is_marked_dead());
    }

    #[tokio::test]
    async fn rebuild_budget_is_bounded() {
        let dead = Arc::new(RecordingDriver::new(Variant::Standard));
        let slot = installed_slot(dead.clone()).await;
        dead.fail_always(native::GET_SESSION_LIST, "invalid window handle");

        let factory: DriverFactory = Arc::new(|variant| {
            let driver = RecordingDriver::new(variant);
            driver.fail_always("connect", "client not running");
            Arc::new(driver) as Arc<dyn Driver>
        });
        let monitor = ConnectionMonitor::new(slot.clone(), factory, &config_fast());

        assert_eq!(monitor.probe_once().await, ProbeOutcome::RetriesExhausted);
        assert!(!slot.is_installed().await);
        assert!(slot.is_marked_dead());
        assert_eq!(monitor.status().reinit_attempts, 2);
    }

    #[tokio::test]
    async fn reconnect_disabled_leaves_slot_empty() {
        let dead = Arc::new(RecordingDriver::new(Variant::Standard));
        let slot = installed_slot(dead.clone()).await;
        dead.fail_always(native::GET_SESSION_LIST, "invalid window handle");

        let factory: DriverFactory =
            Arc::new(|variant| Arc::new(RecordingDriver::new(variant)) as Arc<dyn Driver>);
        let config = BridgeConfig {
            auto_reconnect: false,
            ..config_fast()
        };
        let monitor = ConnectionMonitor::new(slot.clone(), factory, &config);

        assert_eq!(monitor.probe_once().await, ProbeOutcome::Dead);
        assert!(!slot.is_installed().await);
        assert!(slot.is_marked_dead());
    }

    #[tokio::test]
    async fn empty_slot_is_reported_not_rebuilt() {
        let slot = Arc::new(SessionSlot::new());
        let factory: DriverFactory =
            Arc::new(|variant| Arc::new(RecordingDriver::new(variant)) as Arc<dyn Driver>);
        let monitor = ConnectionMonitor::new(slot.clone(), factory, &config_fast());

        assert_eq!(monitor.probe_once().await, ProbeOutcome::Dead);
        assert!(!slot.is_installed().await);
    }
}
