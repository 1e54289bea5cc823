//! Bridge configuration.
//!
//! Read once at startup from `DESKCHAT_*` environment variables; every value
//! has a default so an empty environment yields a working loopback setup.

use std::path::PathBuf;
use std::time::Duration;

use deskchat_observability::canonical_logs_dir_from_root;
use deskchat_types::Variant;

pub const DEFAULT_BRIDGE_HOST: &str = "127.0.0.1";
pub const DEFAULT_BRIDGE_PORT: u16 = 7700;

/// The conversation opened after a successful initialize so the client lands
/// in a known-good window state.
pub const DEFAULT_WARMUP_TARGET: &str = "File Transfer";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Which native library variant drives the desktop client.
    pub variant: Variant,
    /// Required in the `x-deskchat-token` header when set.
    pub api_token: Option<String>,
    pub host: String,
    pub port: u16,

    pub warmup_target: String,
    pub warmup_delay: Duration,

    /// Bound on waiting for the session lock; callers never block forever.
    pub lock_wait: Duration,

    pub monitor_interval: Duration,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub reconnect_max_retry: u32,

    pub recovery_max_attempts: u32,
    pub recovery_retry_delay: Duration,
    /// Fixed pause after reopening a conversation, so the window can render
    /// before re-registration.
    pub recovery_render_delay: Duration,

    pub cache_max_per_target: usize,
    /// Bound on synchronous attachment persistence inside the inbound
    /// callback.
    pub persist_budget: Duration,
    pub artifact_dir: PathBuf,

    pub logs_dir: PathBuf,
    pub log_retention_days: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let data_root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("deskchat");
        Self {
            variant: Variant::Standard,
            api_token: None,
            host: DEFAULT_BRIDGE_HOST.to_string(),
            port: DEFAULT_BRIDGE_PORT,
            warmup_target: DEFAULT_WARMUP_TARGET.to_string(),
            warmup_delay: Duration::from_millis(1000),
            lock_wait: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(60),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(30),
            reconnect_max_retry: 3,
            recovery_max_attempts: 3,
            recovery_retry_delay: Duration::from_millis(500),
            recovery_render_delay: Duration::from_millis(500),
            cache_max_per_target: 100,
            persist_budget: Duration::from_secs(2),
            artifact_dir: data_root.join("artifacts"),
            logs_dir: canonical_logs_dir_from_root(&data_root),
            log_retention_days: 7,
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

impl BridgeConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        if let Ok(raw) = std::env::var("DESKCHAT_VARIANT") {
            cfg.variant = raw.parse().map_err(anyhow::Error::msg)?;
        }
        if let Ok(token) = std::env::var("DESKCHAT_API_TOKEN") {
            if !token.trim().is_empty() {
                cfg.api_token = Some(token);
            }
        }
        if let Ok(host) = std::env::var("DESKCHAT_HOST") {
            cfg.host = host;
        }
        if let Ok(raw) = std::env::var("DESKCHAT_PORT") {
            cfg.port = raw
                .trim()
                .parse::<u16>()
                .map_err(|e| anyhow::anyhow!("invalid DESKCHAT_PORT {raw:?}: {e}"))?;
        }
        if let Ok(target) = std::env::var("DESKCHAT_WARMUP_TARGET") {
            cfg.warmup_target = target;
        }
        if let Some(ms) = env_u64("DESKCHAT_WARMUP_DELAY_MS") {
            cfg.warmup_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("DESKCHAT_LOCK_WAIT_MS") {
            cfg.lock_wait = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("DESKCHAT_CHECK_INTERVAL") {
            cfg.monitor_interval = Duration::from_secs(secs);
        }
        cfg.auto_reconnect = env_bool("DESKCHAT_AUTO_RECONNECT", cfg.auto_reconnect);
        if let Some(secs) = env_u64("DESKCHAT_RECONNECT_DELAY") {
            cfg.reconnect_delay = Duration::from_secs(secs);
        }
        if let Some(n) = env_u64("DESKCHAT_MAX_RETRY") {
            cfg.reconnect_max_retry = n as u32;
        }
        if let Some(n) = env_u64("DESKCHAT_RECOVERY_MAX_ATTEMPTS") {
            cfg.recovery_max_attempts = n as u32;
        }
        if let Some(ms) = env_u64("DESKCHAT_RECOVERY_RETRY_DELAY_MS") {
            cfg.recovery_retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("DESKCHAT_RECOVERY_RENDER_DELAY_MS") {
            cfg.recovery_render_delay = Duration::from_millis(ms);
        }
        if let Some(n) = env_u64("DESKCHAT_CACHE_MAX_PER_TARGET") {
            cfg.cache_max_per_target = n as usize;
        }
        if let Some(ms) = env_u64("DESKCHAT_PERSIST_BUDGET_MS") {
            cfg.persist_budget = Duration::from_millis(ms);
        }
        if let Ok(dir) = std::env::var("DESKCHAT_ARTIFACT_DIR") {
            cfg.artifact_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("DESKCHAT_LOGS_DIR") {
            cfg.logs_dir = PathBuf::from(dir);
        }
        if let Some(days) = env_u64("DESKCHAT_LOG_RETENTION_DAYS") {
            cfg.log_retention_days = days;
        }

        Ok(cfg)
    }
}
