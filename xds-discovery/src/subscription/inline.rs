//! Static in-memory subscription.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use crate::message::ResourceAny;
use crate::stats::SubscriptionStats;
use crate::subscription::{
    ConfigUpdateFailureReason, Subscription, SubscriptionCallbacks,
};

/// A one-shot subscription over resources fixed at construction time.
///
/// Delivers its resources once on `start` and is never revisited; interest
/// updates are meaningless for a static source and are ignored.
pub struct InlineSubscription {
    resources: Vec<ResourceAny>,
    version_info: String,
    callbacks: Box<dyn SubscriptionCallbacks>,
    stats: Arc<SubscriptionStats>,
    delivered: bool,
}

impl InlineSubscription {
    /// Create a subscription over the given fixed resources.
    pub fn new(
        resources: Vec<ResourceAny>,
        version_info: impl Into<String>,
        callbacks: Box<dyn SubscriptionCallbacks>,
        stats: Arc<SubscriptionStats>,
    ) -> Self {
        Self {
            resources,
            version_info: version_info.into(),
            callbacks,
            stats,
            delivered: false,
        }
    }
}

impl Subscription for InlineSubscription {
    fn start(&mut self, _initial_resource_names: BTreeSet<String>) {
        if self.delivered {
            return;
        }
        self.delivered = true;

        self.stats.record_attempt();
        match self
            .callbacks
            .on_config_update(&self.resources, &self.version_info)
        {
            Ok(()) => self.stats.record_success(&self.version_info),
            Err(error) => {
                self.stats.record_rejected();
                self.callbacks
                    .on_config_update_failed(ConfigUpdateFailureReason::UpdateRejected, Some(&error));
            }
        }
    }

    fn update_resource_interest(&mut self, _resource_names: BTreeSet<String>) {
        debug!("interest update on a static subscription ignored");
    }
}
