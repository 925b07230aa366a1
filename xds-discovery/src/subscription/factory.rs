//! Maps config-source descriptors to subscription implementations.

use std::sync::Arc;
use std::time::Duration;

use crate::message::ResourceAny;
use crate::mux::GrpcMux;
use crate::runtime::Runtime;
use crate::stats::SubscriptionStats;
use crate::subscription::grpc::GrpcSubscription;
use crate::subscription::inline::InlineSubscription;
use crate::subscription::polled::{ConfigFetcher, PolledSubscription};
use crate::subscription::{Subscription, SubscriptionCallbacks};

#[cfg(feature = "rt-tokio")]
use crate::subscription::polled::FileFetcher;

/// Declarative descriptor of where configuration comes from.
///
/// Each variant selects one delivery mechanism; the choice is made once at
/// construction time and never switched at runtime. The two stream variants
/// carry the shared mux handle to multiplex onto — the mux must have been
/// built for the matching protocol
/// ([`build`](crate::mux::GrpcMuxBuilder::build) for `Ads`,
/// [`build_delta`](crate::mux::GrpcMuxBuilder::build_delta) for `DeltaAds`).
#[derive(Debug)]
pub enum ConfigSource {
    /// Fixed resources supplied inline; delivered once, never revisited.
    Inline {
        /// The resources to deliver.
        resources: Vec<ResourceAny>,
        /// Version reported for the one-shot delivery.
        version_info: String,
    },
    /// A local file polled for changes.
    #[cfg(feature = "rt-tokio")]
    Filesystem {
        /// Path to the serialized configuration.
        path: std::path::PathBuf,
        /// How often to re-read the file.
        poll_interval: Duration,
    },
    /// State-of-the-world updates over a shared aggregated stream.
    Ads {
        /// The mux carrying the stream.
        mux: GrpcMux,
    },
    /// Incremental updates over a shared aggregated delta stream.
    DeltaAds {
        /// The mux carrying the stream.
        mux: GrpcMux,
    },
}

/// Selects and constructs the concrete [`Subscription`] for a
/// [`ConfigSource`].
#[derive(Debug, Clone)]
pub struct SubscriptionFactory<R> {
    runtime: R,
}

impl<R: Runtime> SubscriptionFactory<R> {
    /// Create a factory spawning polled sources on `runtime`.
    pub fn new(runtime: R) -> Self {
        Self { runtime }
    }

    /// Construct the subscription described by `source`.
    ///
    /// The returned handle has not been started; call
    /// [`Subscription::start`] with the initial resource names.
    pub fn subscription_from_config_source(
        &self,
        source: ConfigSource,
        type_url: impl Into<String>,
        callbacks: Box<dyn SubscriptionCallbacks>,
        stats: Arc<SubscriptionStats>,
        init_fetch_timeout: Option<Duration>,
    ) -> Box<dyn Subscription> {
        let type_url = type_url.into();
        match source {
            ConfigSource::Inline {
                resources,
                version_info,
            } => Box::new(InlineSubscription::new(
                resources,
                version_info,
                callbacks,
                stats,
            )),
            #[cfg(feature = "rt-tokio")]
            ConfigSource::Filesystem {
                path,
                poll_interval,
            } => Box::new(PolledSubscription::new(
                FileFetcher::new(path, type_url),
                poll_interval,
                init_fetch_timeout,
                callbacks,
                stats,
                self.runtime.clone(),
            )),
            ConfigSource::Ads { mux } | ConfigSource::DeltaAds { mux } => Box::new(
                GrpcSubscription::new(mux, type_url, callbacks, stats, init_fetch_timeout),
            ),
        }
    }

    /// Construct a polled subscription over a custom fetcher.
    ///
    /// This is how REST-style sources plug in: implement [`ConfigFetcher`]
    /// with the HTTP client of your choice and reuse the shared polling,
    /// diffing, and failure-reporting machinery.
    pub fn polled_subscription<F: ConfigFetcher>(
        &self,
        fetcher: F,
        poll_interval: Duration,
        callbacks: Box<dyn SubscriptionCallbacks>,
        stats: Arc<SubscriptionStats>,
        init_fetch_timeout: Option<Duration>,
    ) -> Box<dyn Subscription> {
        Box::new(PolledSubscription::new(
            fetcher,
            poll_interval,
            init_fetch_timeout,
            callbacks,
            stats,
            self.runtime.clone(),
        ))
    }
}
