//! A dynamic configuration discovery client for xDS management servers.
//!
//! This crate implements the subscription machinery a proxy uses to
//! receive, validate, and incrementally apply configuration pushed from a
//! remote management server. It handles:
//! - Multiplexing many resource-type subscriptions over one stream
//!   (connection, reconnection with backoff, per-type interest tracking)
//! - Version/nonce bookkeeping and ACK/NACK with error detail
//! - Pause/resume gating to enforce cross-type apply ordering
//! - Both state-of-the-world and incremental (delta) update semantics
//! - Uniform [`Subscription`] handles over non-stream sources (static
//!   inline, polled filesystem, custom polled fetchers)
//!
//! It does NOT interpret any resource payload: resources flow through as
//! opaque typed blobs plus a name/version pair, and consumers accept or
//! reject them through [`SubscriptionCallbacks`].
//!
//! # Example
//!
//! ```ignore
//! use xds_discovery::{
//!     GrpcMux, GrpcSubscription, MuxConfig, Node, ProstCodec, SubscriptionStats,
//!     TokioRuntime, TonicTransport,
//! };
//!
//! let transport = TonicTransport::connect("http://xds.example.com:18000").await?;
//! let config = MuxConfig::new(Node::new("envoy", "1.0").with_id("my-node"));
//! let mux = GrpcMux::builder(config, transport, ProstCodec, TokioRuntime).build();
//!
//! // Consumers register interest per resource type; updates arrive on
//! // their callbacks, and the mux ACKs or NACKs based on the outcome.
//! let mut subscription = GrpcSubscription::new(
//!     mux,
//!     "type.googleapis.com/envoy.config.cluster.v3.Cluster",
//!     Box::new(cluster_manager_callbacks),
//!     std::sync::Arc::new(SubscriptionStats::new()),
//!     None,
//! );
//! subscription.start(["my-cluster".to_string()].into());
//! ```
//!
//! # Feature Flags
//!
//! - `transport-tonic`: Enables the `tonic` transport. This enables the
//!   `rt-tokio` feature. Enabled by default.
//! - `rt-tokio`: Enables the `tokio` runtime and the filesystem fetcher.
//!   Enabled by default.
//! - `codegen-prost`: Enables the `prost`/`envoy-types` codec. Enabled by
//!   default.

pub mod codec;
pub mod error;
pub mod message;
pub mod mux;
pub mod provider;
pub mod resource;
pub mod runtime;
pub mod stats;
pub mod subscription;
pub mod transport;

pub use codec::DiscoveryCodec;
pub use error::{Error, Result};
pub use message::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DeltaResource, DiscoveryRequest,
    DiscoveryResponse, ErrorDetail, Locality, Node, ResourceAny,
};
pub use mux::{Backoff, GrpcMux, GrpcMuxBuilder, MuxConfig, RetryPolicy, WatchId};
pub use provider::{ConfigDecoder, ConfigProvider, ConfigProviderManager, XdsConfigProvider};
pub use resource::{Resource, decode_all};
pub use runtime::Runtime;
pub use stats::SubscriptionStats;
pub use subscription::{
    ConfigFetcher, ConfigSource, ConfigUpdateError, ConfigUpdateFailureReason, FetchedSnapshot,
    GrpcSubscription, InlineSubscription, PolledSubscription, Subscription,
    SubscriptionCallbacks, SubscriptionFactory,
};
pub use transport::{Transport, TransportStream};

// Tokio runtime
#[cfg(feature = "rt-tokio")]
pub use runtime::tokio::TokioRuntime;

// Filesystem fetcher
#[cfg(feature = "rt-tokio")]
pub use subscription::FileFetcher;

// Tonic transport
#[cfg(feature = "transport-tonic")]
pub use transport::tonic::TonicTransport;

// Prost codec
#[cfg(feature = "codegen-prost")]
pub use codec::prost::ProstCodec;
