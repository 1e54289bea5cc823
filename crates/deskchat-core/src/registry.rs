//! Registry of watched conversations.
//!
//! The registry is the durable intent: which targets the bridge should be
//! listening to, in registration order. Native listener state is derived from
//! it — after a session is rebuilt, the registry is what gets replayed.

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use deskchat_types::{normalize_target_name, ListenTarget, WatchOptions};

#[derive(Default)]
pub struct ListenRegistry {
    /// Registration order is preserved; the untargeted drain walks this.
    targets: Mutex<Vec<ListenTarget>>,
}

impl ListenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a watch. Insert-only: a target that is already watched keeps
    /// its existing entry untouched. Returns whether a new entry was added.
    pub fn register(&self, target: &str, options: WatchOptions) -> bool {
        let key = normalize_target_name(target);
        let mut targets = self.targets.lock();
        if targets.iter().any(|t| t.target == key) {
            info!(target = %key, "watch already registered");
            return false;
        }
        targets.push(ListenTarget::new(key.clone(), options));
        info!(target = %key, "watch registered");
        true
    }

    /// Drop a watch. Absent targets are a no-op; removal is idempotent.
    pub fn remove(&self, target: &str) -> bool {
        let key = normalize_target_name(target);
        let mut targets = self.targets.lock();
        let before = targets.len();
        targets.retain(|t| t.target != key);
        let removed = targets.len() != before;
        if removed {
            info!(target = %key, "watch removed");
        } else {
            warn!(target = %key, "watch removal for unknown target ignored");
        }
        removed
    }

    pub fn contains(&self, target: &str) -> bool {
        let key = normalize_target_name(target);
        self.targets.lock().iter().any(|t| t.target == key)
    }

    pub fn options_for(&self, target: &str) -> Option<WatchOptions> {
        let key = normalize_target_name(target);
        self.targets
            .lock()
            .iter()
            .find(|t| t.target == key)
            .map(|t| t.options)
    }

    /// Mark a target as recently seen healthy.
    pub fn touch(&self, target: &str) {
        let key = normalize_target_name(target);
        if let Some(t) = self.targets.lock().iter_mut().find(|t| t.target == key) {
            t.last_ok_at = Utc::now();
        }
    }

    pub fn snapshot(&self) -> Vec<ListenTarget> {
        self.targets.lock().clone()
    }

    /// Target names in registration order.
    pub fn order(&self) -> Vec<String> {
        self.targets.lock().iter().map(|t| t.target.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.targets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.lock().is_empty()
    }
}
