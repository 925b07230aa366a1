//! Per-subscription statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::hash::{DefaultHasher, Hash, Hasher};

/// Counters and gauges tracking the health of one subscription.
///
/// Shared between the caller and the mux worker via `Arc`; all cells are
/// updated with relaxed ordering since readers only need eventually
/// consistent snapshots.
///
/// `update_success + update_rejected <= update_attempt` holds at all times:
/// both outcomes are only recorded against a delivered update attempt.
/// Transport-level failures (`update_failure`) and init-fetch timeouts are
/// counted independently because no update was ever delivered.
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    /// Updates delivered to the subscription callbacks.
    pub update_attempt: AtomicU64,
    /// Updates accepted and ACKed.
    pub update_success: AtomicU64,
    /// Updates rejected by the callbacks and NACKed.
    pub update_rejected: AtomicU64,
    /// Transport failures (stream drop, connect failure) observed while
    /// the subscription was active.
    pub update_failure: AtomicU64,
    /// Init-fetch timers that expired before any response arrived.
    pub init_fetch_timeout: AtomicU64,
    /// Hash of the currently acknowledged version string, 0 before the
    /// first accepted update.
    pub version: AtomicU64,
}

impl SubscriptionStats {
    /// Create a zeroed stats block.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_attempt(&self) {
        self.update_attempt.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self, version_info: &str) {
        self.update_success.fetch_add(1, Ordering::Relaxed);
        self.version
            .store(version_hash(version_info), Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.update_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.update_failure.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_init_fetch_timeout(&self) {
        self.init_fetch_timeout.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of the version gauge.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }
}

/// Stable hash of a version string for the `version` gauge.
pub(crate) fn version_hash(version_info: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    version_info.hash(&mut hasher);
    hasher.finish()
}
