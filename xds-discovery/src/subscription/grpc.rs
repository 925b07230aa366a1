//! Mux-backed subscription.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::mux::{GrpcMux, WatchId};
use crate::stats::SubscriptionStats;
use crate::subscription::{Subscription, SubscriptionCallbacks};

/// A subscription delivered over a shared [`GrpcMux`] stream.
///
/// Works with both state-of-the-world and delta muxes; which protocol the
/// updates arrive by was fixed when the mux was built. Dropping the
/// subscription removes its watch from the mux.
pub struct GrpcSubscription {
    mux: GrpcMux,
    type_url: String,
    /// Handed to the mux on `start`.
    callbacks: Option<Box<dyn SubscriptionCallbacks>>,
    stats: Arc<SubscriptionStats>,
    init_fetch_timeout: Option<Duration>,
    watch: Option<WatchId>,
}

impl GrpcSubscription {
    /// Create a subscription that will register with `mux` on start.
    pub fn new(
        mux: GrpcMux,
        type_url: impl Into<String>,
        callbacks: Box<dyn SubscriptionCallbacks>,
        stats: Arc<SubscriptionStats>,
        init_fetch_timeout: Option<Duration>,
    ) -> Self {
        Self {
            mux,
            type_url: type_url.into(),
            callbacks: Some(callbacks),
            stats,
            init_fetch_timeout,
            watch: None,
        }
    }
}

impl Subscription for GrpcSubscription {
    fn start(&mut self, initial_resource_names: BTreeSet<String>) {
        if self.watch.is_some() {
            return;
        }
        let Some(callbacks) = self.callbacks.take() else {
            return;
        };
        let watch = self.mux.add_subscription(
            initial_resource_names,
            self.type_url.clone(),
            callbacks,
            Arc::clone(&self.stats),
            self.init_fetch_timeout,
        );
        self.watch = Some(watch);
        self.mux.start();
    }

    fn update_resource_interest(&mut self, resource_names: BTreeSet<String>) {
        match self.watch {
            Some(watch) => self.mux.update_resource_interest(watch, resource_names),
            None => debug!(
                type_url = %self.type_url,
                "interest update before start ignored"
            ),
        }
    }
}

impl Drop for GrpcSubscription {
    fn drop(&mut self) {
        if let Some(watch) = self.watch.take() {
            self.mux.remove_watch(watch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::prost::ProstCodec;
    use crate::error::Result;
    use crate::message::{Node, ResourceAny};
    use crate::mux::MuxConfig;
    use crate::runtime::tokio::TokioRuntime;
    use crate::subscription::{ConfigUpdateError, ConfigUpdateFailureReason};
    use crate::transport::{Transport, TransportStream};
    use bytes::Bytes;
    use envoy_types::pb::envoy::service::discovery::v3 as discovery;
    use prost::Message as _;
    use std::sync::Mutex;
    use std::time::Duration;

    struct NoopCallbacks;

    impl SubscriptionCallbacks for NoopCallbacks {
        fn on_config_update(
            &mut self,
            _resources: &[ResourceAny],
            _version_info: &str,
        ) -> std::result::Result<(), ConfigUpdateError> {
            Ok(())
        }

        fn on_config_update_failed(
            &mut self,
            _reason: ConfigUpdateFailureReason,
            _error: Option<&ConfigUpdateError>,
        ) {
        }
    }

    /// Records every initial-request batch handed to `new_stream`.
    #[derive(Clone)]
    struct CaptureTransport {
        initial: Arc<Mutex<Vec<Vec<Bytes>>>>,
    }

    struct HoldStream;

    impl TransportStream for HoldStream {
        async fn send(&mut self, _request: Bytes) -> Result<()> {
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<Bytes>> {
            std::future::pending().await
        }
    }

    impl Transport for CaptureTransport {
        type Stream = HoldStream;

        async fn new_stream(&self, initial: Vec<Bytes>) -> Result<Self::Stream> {
            self.initial.lock().unwrap().push(initial);
            Ok(HoldStream)
        }

        async fn new_delta_stream(&self, initial: Vec<Bytes>) -> Result<Self::Stream> {
            self.initial.lock().unwrap().push(initial);
            Ok(HoldStream)
        }
    }

    #[tokio::test]
    async fn start_registers_interest_with_the_mux() {
        let initial = Arc::new(Mutex::new(Vec::new()));
        let transport = CaptureTransport {
            initial: Arc::clone(&initial),
        };
        let mux = GrpcMux::builder(
            MuxConfig::new(Node::new("test", "0")),
            transport,
            ProstCodec,
            TokioRuntime,
        )
        .build();

        let mut subscription = GrpcSubscription::new(
            mux,
            "type.googleapis.com/envoy.config.cluster.v3.Cluster",
            Box::new(NoopCallbacks),
            Arc::new(SubscriptionStats::new()),
            None,
        );
        subscription.start(["cluster-a".to_string()].into());

        while initial.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let batches = initial.lock().unwrap().clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        let request = discovery::DiscoveryRequest::decode(batches[0][0].clone()).unwrap();
        assert_eq!(request.resource_names, vec!["cluster-a"]);

        // Starting again does not open a second stream.
        subscription.start(["cluster-a".to_string()].into());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(initial.lock().unwrap().len(), 1);
    }
}
