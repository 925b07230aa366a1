//! Binding applied configuration to live runtime state.
//!
//! A [`ConfigProvider`] exposes the currently applied configuration
//! snapshot to the data plane through a lock-free swap. Providers come in
//! two kinds: static (one-shot, never revisited) and xDS-driven (wrapping a
//! [`Subscription`], re-published on every accepted update). Republishing
//! an identical configuration is a no-op, so readers holding the previous
//! snapshot see no churn.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tracing::warn;

use crate::message::ResourceAny;
use crate::runtime::Runtime;
use crate::stats::SubscriptionStats;
use crate::subscription::{
    ConfigSource, ConfigUpdateError, ConfigUpdateFailureReason, Subscription,
    SubscriptionCallbacks, SubscriptionFactory,
};

/// Decodes a type's raw resources into the consumer's config representation.
///
/// Returning `Err` rejects the update (NACK upstream); the provider keeps
/// serving the last accepted snapshot.
pub trait ConfigDecoder: Send + 'static {
    /// The decoded configuration type.
    type Config: PartialEq + Send + Sync + 'static;

    /// Decode and validate one update's resources.
    fn decode(
        &mut self,
        resources: &[ResourceAny],
        version_info: &str,
    ) -> Result<Self::Config, ConfigUpdateError>;
}

impl<T, F> ConfigDecoder for F
where
    T: PartialEq + Send + Sync + 'static,
    F: FnMut(&[ResourceAny], &str) -> Result<T, ConfigUpdateError> + Send + 'static,
{
    type Config = T;

    fn decode(
        &mut self,
        resources: &[ResourceAny],
        version_info: &str,
    ) -> Result<T, ConfigUpdateError> {
        self(resources, version_info)
    }
}

/// Read handle over the currently applied configuration snapshot.
///
/// Cheap to clone; `config()` is wait-free and safe to call from the data
/// path. Returns `None` until the first configuration is applied.
#[derive(Debug)]
pub struct ConfigProvider<T> {
    snapshot: Arc<ArcSwapOption<T>>,
}

impl<T> Clone for ConfigProvider<T> {
    fn clone(&self) -> Self {
        Self {
            snapshot: Arc::clone(&self.snapshot),
        }
    }
}

impl<T> ConfigProvider<T> {
    /// The currently applied configuration, if any.
    pub fn config(&self) -> Option<Arc<T>> {
        self.snapshot.load_full()
    }
}

/// Publishes accepted updates into the snapshot.
struct ProviderCallbacks<D: ConfigDecoder> {
    snapshot: Arc<ArcSwapOption<D::Config>>,
    decoder: D,
    stat_prefix: String,
}

impl<D: ConfigDecoder> SubscriptionCallbacks for ProviderCallbacks<D> {
    fn on_config_update(
        &mut self,
        resources: &[ResourceAny],
        version_info: &str,
    ) -> Result<(), ConfigUpdateError> {
        let decoded = self.decoder.decode(resources, version_info)?;

        // Reapplying an identical configuration is a no-op; readers keep
        // the existing snapshot pointer.
        if self
            .snapshot
            .load()
            .as_ref()
            .is_some_and(|current| **current == decoded)
        {
            return Ok(());
        }

        self.snapshot.store(Some(Arc::new(decoded)));
        Ok(())
    }

    fn on_config_update_failed(
        &mut self,
        reason: ConfigUpdateFailureReason,
        error: Option<&ConfigUpdateError>,
    ) {
        // Keep serving the last accepted snapshot.
        match error {
            Some(error) => warn!(
                provider = %self.stat_prefix,
                ?reason,
                %error,
                "config update failed"
            ),
            None => warn!(provider = %self.stat_prefix, ?reason, "config update failed"),
        }
    }
}

/// An xDS-driven provider: the snapshot handle plus the subscription and
/// stats backing it. Dropping it tears the subscription down.
pub struct XdsConfigProvider<T> {
    provider: ConfigProvider<T>,
    stats: Arc<SubscriptionStats>,
    subscription: Box<dyn Subscription>,
}

impl<T> XdsConfigProvider<T> {
    /// The currently applied configuration, if any.
    pub fn config(&self) -> Option<Arc<T>> {
        self.provider.config()
    }

    /// A clonable read handle for the data path.
    pub fn provider(&self) -> ConfigProvider<T> {
        self.provider.clone()
    }

    /// Counters for the backing subscription.
    pub fn stats(&self) -> &Arc<SubscriptionStats> {
        &self.stats
    }

    /// Replace the set of resource names the provider is interested in.
    pub fn update_resource_interest(&mut self, resource_names: BTreeSet<String>) {
        self.subscription.update_resource_interest(resource_names);
    }
}

/// Creates configuration providers from one-shot messages or config
/// sources.
#[derive(Debug, Clone)]
pub struct ConfigProviderManager<R> {
    factory: SubscriptionFactory<R>,
}

impl<R: Runtime> ConfigProviderManager<R> {
    /// Create a manager constructing subscriptions through `factory`.
    pub fn new(factory: SubscriptionFactory<R>) -> Self {
        Self { factory }
    }

    /// Bind an already-decoded configuration message; it is applied once
    /// and never revisited.
    pub fn create_static_provider<T>(&self, config: T) -> ConfigProvider<T>
    where
        T: PartialEq + Send + Sync + 'static,
    {
        ConfigProvider {
            snapshot: Arc::new(ArcSwapOption::from(Some(Arc::new(config)))),
        }
    }

    /// Bind a config source: every accepted update is decoded and
    /// published to the returned provider's snapshot.
    ///
    /// `stat_prefix` labels this provider in logs and diagnostics.
    pub fn create_xds_provider<D>(
        &self,
        source: ConfigSource,
        type_url: impl Into<String>,
        stat_prefix: impl Into<String>,
        initial_resource_names: BTreeSet<String>,
        init_fetch_timeout: Option<Duration>,
        decoder: D,
    ) -> XdsConfigProvider<D::Config>
    where
        D: ConfigDecoder,
    {
        let snapshot: Arc<ArcSwapOption<D::Config>> = Arc::new(ArcSwapOption::empty());
        let stats = Arc::new(SubscriptionStats::new());

        let callbacks = ProviderCallbacks {
            snapshot: Arc::clone(&snapshot),
            decoder,
            stat_prefix: stat_prefix.into(),
        };

        let mut subscription = self.factory.subscription_from_config_source(
            source,
            type_url,
            Box::new(callbacks),
            Arc::clone(&stats),
            init_fetch_timeout,
        );
        subscription.start(initial_resource_names);

        XdsConfigProvider {
            provider: ConfigProvider { snapshot },
            stats,
            subscription,
        }
    }
}
