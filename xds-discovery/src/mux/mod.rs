//! Stream multiplexer for discovery subscriptions.
//!
//! A [`GrpcMux`] owns one bidirectional stream to the management server and
//! multiplexes many logically independent resource-type subscriptions over
//! it. The handle is cheap to clone; all calls are marshaled onto a single
//! background worker task that exclusively owns the stream, every type's
//! interest set, and every watch — no state is shared across threads.
//!
//! The worker runs until every handle (and every subscription built on it)
//! has been dropped.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::codec::DiscoveryCodec;
use crate::message::Node;
use crate::runtime::Runtime;
use crate::stats::SubscriptionStats;
use crate::subscription::SubscriptionCallbacks;
use crate::transport::Transport;

pub mod retry;
pub(crate) mod watch;

mod delta;
mod sotw;

pub use retry::{Backoff, RetryPolicy};
pub use watch::WatchId;

/// Configuration for a mux.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Node identification sent to the management server.
    pub node: Node,

    /// Retry policy controlling reconnect backoff.
    pub retry_policy: RetryPolicy,
}

impl MuxConfig {
    /// Create a new configuration with the given node identification and
    /// the default retry policy.
    pub fn new(node: Node) -> Self {
        Self {
            node,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Calls marshaled from mux handles onto the worker task.
pub(crate) enum MuxCommand {
    Start,
    AddWatch {
        type_url: String,
        watch: WatchId,
        resource_names: BTreeSet<String>,
        callbacks: Box<dyn SubscriptionCallbacks>,
        stats: Arc<SubscriptionStats>,
        init_fetch_timeout: Option<Duration>,
    },
    UpdateWatch {
        watch: WatchId,
        resource_names: BTreeSet<String>,
    },
    RemoveWatch {
        watch: WatchId,
    },
    Pause {
        type_url: String,
    },
    Resume {
        type_url: String,
    },
    QueryPaused {
        type_url: String,
        reply: oneshot::Sender<bool>,
    },
    InitFetchTimerExpired {
        type_url: String,
        watch: WatchId,
    },
}

/// Builder for a [`GrpcMux`].
#[derive(Debug)]
pub struct GrpcMuxBuilder<T, C, R> {
    config: MuxConfig,
    transport: T,
    codec: C,
    runtime: R,
}

impl<T, C, R> GrpcMuxBuilder<T, C, R>
where
    T: Transport,
    C: DiscoveryCodec,
    R: Runtime,
{
    /// Create a new builder with the given configuration, transport, codec,
    /// and runtime.
    pub fn new(config: MuxConfig, transport: T, codec: C, runtime: R) -> Self {
        Self {
            config,
            transport,
            codec,
            runtime,
        }
    }

    /// Build a state-of-the-world mux and spawn its background worker.
    pub fn build(self) -> GrpcMux {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let worker = sotw::SotwWorker::new(
            self.transport,
            self.codec,
            self.runtime.clone(),
            self.config,
            command_tx.downgrade(),
            command_rx,
        );
        self.runtime.spawn(worker.run());

        GrpcMux { command_tx }
    }

    /// Build an incremental (delta) mux and spawn its background worker.
    pub fn build_delta(self) -> GrpcMux {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let worker = delta::DeltaWorker::new(
            self.transport,
            self.codec,
            self.runtime.clone(),
            self.config,
            command_tx.downgrade(),
            command_rx,
        );
        self.runtime.spawn(worker.run());

        GrpcMux { command_tx }
    }
}

/// Handle to a discovery stream multiplexer.
///
/// Whether the mux speaks state-of-the-world or delta semantics is fixed by
/// the builder method that created it and never changes at runtime.
#[derive(Clone, Debug)]
pub struct GrpcMux {
    command_tx: mpsc::UnboundedSender<MuxCommand>,
}

impl GrpcMux {
    /// Create a new builder with the given configuration, transport, codec,
    /// and runtime.
    pub fn builder<T, C, R>(
        config: MuxConfig,
        transport: T,
        codec: C,
        runtime: R,
    ) -> GrpcMuxBuilder<T, C, R>
    where
        T: Transport,
        C: DiscoveryCodec,
        R: Runtime,
    {
        GrpcMuxBuilder::new(config, transport, codec, runtime)
    }

    /// Open the underlying stream.
    ///
    /// Idempotent. If the stream cannot be established every registered
    /// type enters a capped exponential retry loop rather than failing
    /// permanently. The worker only connects once at least one watch is
    /// registered, so it always has an initial request to send.
    pub fn start(&self) {
        self.send(MuxCommand::Start);
    }

    /// Register a new watch for `type_url` covering `resource_names`
    /// (empty set = wildcard).
    ///
    /// Merges the names into the type's interest set and triggers a fresh
    /// request if the merged set changed. If `init_fetch_timeout` is set
    /// and nonzero, a timer is armed that reports
    /// [`FetchTimedOut`](crate::subscription::ConfigUpdateFailureReason::FetchTimedOut)
    /// exactly once if no response for this type arrives in time.
    pub fn add_subscription(
        &self,
        resource_names: BTreeSet<String>,
        type_url: impl Into<String>,
        callbacks: Box<dyn SubscriptionCallbacks>,
        stats: Arc<SubscriptionStats>,
        init_fetch_timeout: Option<Duration>,
    ) -> WatchId {
        let watch = WatchId::new();
        self.send(MuxCommand::AddWatch {
            type_url: type_url.into(),
            watch,
            resource_names,
            callbacks,
            stats,
            init_fetch_timeout,
        });
        watch
    }

    /// Attach a new watch, or update an existing watch's names.
    ///
    /// `callbacks`, `stats`, and `init_fetch_timeout` are only used when
    /// `watch` is `None` (a new watch); updates keep the originals.
    #[allow(clippy::too_many_arguments)]
    pub fn add_or_update_watch(
        &self,
        type_url: &str,
        watch: Option<WatchId>,
        resource_names: BTreeSet<String>,
        callbacks: Box<dyn SubscriptionCallbacks>,
        stats: Arc<SubscriptionStats>,
        init_fetch_timeout: Option<Duration>,
    ) -> WatchId {
        match watch {
            Some(watch) => {
                self.update_resource_interest(watch, resource_names);
                watch
            }
            None => self.add_subscription(
                resource_names,
                type_url,
                callbacks,
                stats,
                init_fetch_timeout,
            ),
        }
    }

    /// Replace a watch's resource-name contribution.
    ///
    /// Recomputes the type's merged interest set; if it changed, a new
    /// outbound request is scheduled. Rapid successive changes while the
    /// type cannot flush (paused, disconnected) coalesce into one request
    /// reflecting the latest state.
    pub fn update_resource_interest(&self, watch: WatchId, resource_names: BTreeSet<String>) {
        self.send(MuxCommand::UpdateWatch {
            watch,
            resource_names,
        });
    }

    /// Detach a watch without destroying its type's state.
    ///
    /// Removing the last watch of a type clears its interest set, sends an
    /// unsubscribe-all request, and cancels any pending init-fetch timer.
    pub fn remove_watch(&self, watch: WatchId) {
        self.send(MuxCommand::RemoveWatch { watch });
    }

    /// Suspend request flushing and response application for one type.
    ///
    /// Nests: each `pause` must be matched by a [`resume`](Self::resume)
    /// before the type re-activates. Responses received while paused are
    /// buffered and replayed in arrival order on resume.
    pub fn pause(&self, type_url: impl Into<String>) {
        self.send(MuxCommand::Pause {
            type_url: type_url.into(),
        });
    }

    /// Undo one [`pause`](Self::pause); replays buffered responses when the
    /// pause depth returns to zero.
    pub fn resume(&self, type_url: impl Into<String>) {
        self.send(MuxCommand::Resume {
            type_url: type_url.into(),
        });
    }

    /// Whether the type is currently paused.
    pub async fn paused(&self, type_url: impl Into<String>) -> bool {
        let (reply, rx) = oneshot::channel();
        self.send(MuxCommand::QueryPaused {
            type_url: type_url.into(),
            reply,
        });
        rx.await.unwrap_or(false)
    }

    fn send(&self, command: MuxCommand) {
        // A closed channel means the worker is gone; calls become no-ops,
        // matching a mux that is shutting down.
        let _ = self.command_tx.send(command);
    }
}
