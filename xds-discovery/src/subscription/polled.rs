//! Polled fetch-and-diff subscription.
//!
//! For delivery mechanisms without a push channel (filesystem, REST-style
//! endpoints), a [`PolledSubscription`] runs a fetch loop on a timer over a
//! [`ConfigFetcher`] and synthesizes the same [`SubscriptionCallbacks`]
//! calls the stream-backed subscriptions make. Only a changed version is
//! delivered; fetch failures are surfaced as connection failures and do not
//! stop the loop.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::message::ResourceAny;
use crate::runtime::Runtime;
use crate::stats::SubscriptionStats;
use crate::subscription::{
    ConfigUpdateFailureReason, Subscription, SubscriptionCallbacks,
};

#[cfg(feature = "rt-tokio")]
use crate::error::Error;

/// One fetched configuration snapshot.
#[derive(Debug, Clone)]
pub struct FetchedSnapshot {
    /// Version of the snapshot. Deliveries are keyed off this: a fetch
    /// returning the already-delivered version is a no-op, so it must
    /// change whenever the content does.
    pub version_info: String,
    /// The complete current resource set.
    pub resources: Vec<ResourceAny>,
}

/// Capability seam for polled configuration sources.
///
/// Implementations fetch the complete current configuration for the given
/// resource names. A REST-style source would issue its HTTP request here;
/// the shipped [`FileFetcher`] reads a local file.
pub trait ConfigFetcher: Send + 'static {
    /// Fetch the current snapshot.
    fn fetch(
        &mut self,
        resource_names: &BTreeSet<String>,
    ) -> impl Future<Output = Result<FetchedSnapshot>> + Send;
}

enum PolledCommand {
    Start { resource_names: BTreeSet<String> },
    UpdateInterest { resource_names: BTreeSet<String> },
    InitFetchExpired,
}

/// A subscription backed by a periodic fetch loop.
///
/// Dropping the handle stops the loop.
pub struct PolledSubscription {
    command_tx: mpsc::UnboundedSender<PolledCommand>,
}

impl PolledSubscription {
    /// Create the subscription and spawn its fetch loop on `runtime`.
    ///
    /// The loop idles until [`start`](Subscription::start).
    pub fn new<F, R>(
        fetcher: F,
        poll_interval: Duration,
        init_fetch_timeout: Option<Duration>,
        callbacks: Box<dyn SubscriptionCallbacks>,
        stats: Arc<SubscriptionStats>,
        runtime: R,
    ) -> Self
    where
        F: ConfigFetcher,
        R: Runtime,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let worker = PolledWorker {
            fetcher,
            runtime: runtime.clone(),
            poll_interval,
            init_fetch_timeout,
            callbacks,
            stats,
            command_tx: command_tx.downgrade(),
            command_rx,
            resource_names: BTreeSet::new(),
            last_version: None,
            last_rejected_version: None,
            received_update: false,
        };
        runtime.spawn(worker.run());

        Self { command_tx }
    }

    fn send(&self, command: PolledCommand) {
        let _ = self.command_tx.send(command);
    }
}

impl Subscription for PolledSubscription {
    fn start(&mut self, initial_resource_names: BTreeSet<String>) {
        self.send(PolledCommand::Start {
            resource_names: initial_resource_names,
        });
    }

    fn update_resource_interest(&mut self, resource_names: BTreeSet<String>) {
        self.send(PolledCommand::UpdateInterest { resource_names });
    }
}

struct PolledWorker<F, R> {
    fetcher: F,
    runtime: R,
    poll_interval: Duration,
    init_fetch_timeout: Option<Duration>,
    callbacks: Box<dyn SubscriptionCallbacks>,
    stats: Arc<SubscriptionStats>,
    command_tx: mpsc::WeakUnboundedSender<PolledCommand>,
    command_rx: mpsc::UnboundedReceiver<PolledCommand>,
    resource_names: BTreeSet<String>,
    /// Version of the last accepted delivery.
    last_version: Option<String>,
    /// Version of the last rejected delivery; not retried until the source
    /// publishes something new.
    last_rejected_version: Option<String>,
    received_update: bool,
}

impl<F, R> PolledWorker<F, R>
where
    F: ConfigFetcher,
    R: Runtime,
{
    async fn run(mut self) {
        // Idle until started; interest updates before start just replace
        // the initial set.
        loop {
            match self.command_rx.recv().await {
                Some(PolledCommand::Start { resource_names }) => {
                    self.resource_names = resource_names;
                    break;
                }
                Some(PolledCommand::UpdateInterest { resource_names }) => {
                    self.resource_names = resource_names;
                }
                Some(PolledCommand::InitFetchExpired) => {}
                None => return,
            }
        }

        self.arm_init_fetch_timer();

        loop {
            self.poll_once().await;

            tokio::select! {
                _ = self.runtime.sleep(self.poll_interval) => {}
                command = self.command_rx.recv() => {
                    match command {
                        Some(PolledCommand::Start { .. }) => {}
                        Some(PolledCommand::UpdateInterest { resource_names }) => {
                            if resource_names != self.resource_names {
                                debug!("resource interest changed, refetching");
                                self.resource_names = resource_names;
                            }
                        }
                        Some(PolledCommand::InitFetchExpired) => {
                            self.handle_init_fetch_timeout();
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn poll_once(&mut self) {
        match self.fetcher.fetch(&self.resource_names).await {
            Ok(snapshot) => {
                self.received_update = true;
                let version = snapshot.version_info.as_str();
                if self.last_version.as_deref() == Some(version)
                    || self.last_rejected_version.as_deref() == Some(version)
                {
                    return;
                }

                self.stats.record_attempt();
                match self
                    .callbacks
                    .on_config_update(&snapshot.resources, &snapshot.version_info)
                {
                    Ok(()) => {
                        self.stats.record_success(&snapshot.version_info);
                        self.last_version = Some(snapshot.version_info);
                        self.last_rejected_version = None;
                    }
                    Err(error) => {
                        warn!(%error, "polled update rejected");
                        self.stats.record_rejected();
                        self.callbacks.on_config_update_failed(
                            ConfigUpdateFailureReason::UpdateRejected,
                            Some(&error),
                        );
                        self.last_rejected_version = Some(snapshot.version_info);
                    }
                }
            }
            Err(error) => {
                warn!(%error, "config fetch failed");
                self.stats.record_failure();
                self.callbacks
                    .on_config_update_failed(ConfigUpdateFailureReason::ConnectionFailure, None);
            }
        }
    }

    fn arm_init_fetch_timer(&mut self) {
        let Some(timeout) = self.init_fetch_timeout else {
            return;
        };
        if timeout.is_zero() {
            return;
        }
        let command_tx = self.command_tx.clone();
        let runtime = self.runtime.clone();
        self.runtime.spawn(async move {
            runtime.sleep(timeout).await;
            if let Some(command_tx) = command_tx.upgrade() {
                let _ = command_tx.send(PolledCommand::InitFetchExpired);
            }
        });
    }

    fn handle_init_fetch_timeout(&mut self) {
        if self.received_update {
            return;
        }
        warn!("no configuration received within the init fetch timeout");
        self.stats.record_init_fetch_timeout();
        self.callbacks
            .on_config_update_failed(ConfigUpdateFailureReason::FetchTimedOut, None);
    }
}

/// Reads the whole file as one opaque resource payload; the version is a
/// content hash, so an unchanged file is never re-delivered.
#[cfg(feature = "rt-tokio")]
pub struct FileFetcher {
    path: std::path::PathBuf,
    type_url: String,
}

#[cfg(feature = "rt-tokio")]
impl FileFetcher {
    /// Create a fetcher for the file at `path`, tagging its payload with
    /// `type_url`.
    pub fn new(path: impl Into<std::path::PathBuf>, type_url: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            type_url: type_url.into(),
        }
    }
}

#[cfg(feature = "rt-tokio")]
impl ConfigFetcher for FileFetcher {
    async fn fetch(&mut self, _resource_names: &BTreeSet<String>) -> Result<FetchedSnapshot> {
        use std::hash::{DefaultHasher, Hash, Hasher};

        let contents = tokio::fs::read(&self.path).await.map_err(|error| {
            Error::Connection(format!(
                "failed to read {}: {error}",
                self.path.display()
            ))
        })?;

        let mut hasher = DefaultHasher::new();
        contents.hash(&mut hasher);
        let version_info = format!("{:016x}", hasher.finish());

        Ok(FetchedSnapshot {
            version_info,
            resources: vec![ResourceAny {
                type_url: self.type_url.clone(),
                value: contents.into(),
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tokio::TokioRuntime;
    use crate::subscription::ConfigUpdateError;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Update { version: String },
        Failed { reason: ConfigUpdateFailureReason },
    }

    type EventLog = Arc<Mutex<Vec<Event>>>;

    struct RecordingCallbacks {
        events: EventLog,
        reject: bool,
    }

    impl SubscriptionCallbacks for RecordingCallbacks {
        fn on_config_update(
            &mut self,
            _resources: &[ResourceAny],
            version_info: &str,
        ) -> std::result::Result<(), ConfigUpdateError> {
            self.events.lock().unwrap().push(Event::Update {
                version: version_info.to_string(),
            });
            if self.reject {
                Err(ConfigUpdateError::new("rejected"))
            } else {
                Ok(())
            }
        }

        fn on_config_update_failed(
            &mut self,
            reason: ConfigUpdateFailureReason,
            _error: Option<&ConfigUpdateError>,
        ) {
            self.events.lock().unwrap().push(Event::Failed { reason });
        }
    }

    /// Serves a shared, mutable snapshot; `None` means the fetch fails.
    #[derive(Clone)]
    struct ScriptFetcher {
        snapshot: Arc<Mutex<Option<FetchedSnapshot>>>,
        seen_names: Arc<Mutex<Vec<BTreeSet<String>>>>,
    }

    impl ScriptFetcher {
        fn serving(version: &str) -> Self {
            Self {
                snapshot: Arc::new(Mutex::new(Some(snapshot(version)))),
                seen_names: Arc::default(),
            }
        }

        fn failing() -> Self {
            Self {
                snapshot: Arc::new(Mutex::new(None)),
                seen_names: Arc::default(),
            }
        }
    }

    impl ConfigFetcher for ScriptFetcher {
        async fn fetch(&mut self, resource_names: &BTreeSet<String>) -> Result<FetchedSnapshot> {
            self.seen_names.lock().unwrap().push(resource_names.clone());
            match self.snapshot.lock().unwrap().clone() {
                Some(snapshot) => Ok(snapshot),
                None => Err(crate::error::Error::Connection("fetch failed".into())),
            }
        }
    }

    fn snapshot(version: &str) -> FetchedSnapshot {
        FetchedSnapshot {
            version_info: version.to_string(),
            resources: vec![ResourceAny {
                type_url: "type.googleapis.com/test.Resource".to_string(),
                value: bytes::Bytes::from_static(b"payload"),
            }],
        }
    }

    fn subscription(
        fetcher: ScriptFetcher,
        init_fetch_timeout: Option<Duration>,
    ) -> (PolledSubscription, EventLog, Arc<SubscriptionStats>) {
        let events: EventLog = Arc::default();
        let stats = Arc::new(SubscriptionStats::new());
        let subscription = PolledSubscription::new(
            fetcher,
            Duration::from_millis(100),
            init_fetch_timeout,
            Box::new(RecordingCallbacks {
                events: Arc::clone(&events),
                reject: false,
            }),
            Arc::clone(&stats),
            TokioRuntime,
        );
        (subscription, events, stats)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_only_changed_versions() {
        let fetcher = ScriptFetcher::serving("v1");
        let (mut subscription, events, stats) = subscription(fetcher.clone(), None);
        subscription.start(BTreeSet::new());

        wait_until(|| !events.lock().unwrap().is_empty()).await;
        assert_eq!(
            *events.lock().unwrap(),
            vec![Event::Update {
                version: "v1".into()
            }]
        );

        // Several polls of the same version deliver nothing new.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(events.lock().unwrap().len(), 1);
        assert_eq!(stats.update_attempt.load(Ordering::Relaxed), 1);

        *fetcher.snapshot.lock().unwrap() = Some(snapshot("v2"));
        wait_until(|| events.lock().unwrap().len() == 2).await;
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&Event::Update {
                version: "v2".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_surfaces_and_loop_continues() {
        let fetcher = ScriptFetcher::failing();
        let (mut subscription, events, stats) = subscription(fetcher.clone(), None);
        subscription.start(BTreeSet::new());

        wait_until(|| stats.update_failure.load(Ordering::Relaxed) >= 2).await;
        assert!(events.lock().unwrap().contains(&Event::Failed {
            reason: ConfigUpdateFailureReason::ConnectionFailure
        }));

        // Recovery: the next successful fetch delivers normally.
        *fetcher.snapshot.lock().unwrap() = Some(snapshot("v1"));
        wait_until(|| {
            events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, Event::Update { .. }))
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn init_fetch_timeout_fires_once_without_updates() {
        let fetcher = ScriptFetcher::failing();
        let (mut subscription, events, stats) =
            subscription(fetcher, Some(Duration::from_millis(50)));
        subscription.start(BTreeSet::new());

        wait_until(|| stats.init_fetch_timeout.load(Ordering::Relaxed) == 1).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let timeouts = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    Event::Failed {
                        reason: ConfigUpdateFailureReason::FetchTimedOut
                    }
                )
            })
            .count();
        assert_eq!(timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn interest_update_reaches_the_fetcher() {
        let fetcher = ScriptFetcher::serving("v1");
        let seen = Arc::clone(&fetcher.seen_names);
        let (mut subscription, _events, _stats) = subscription(fetcher, None);

        subscription.start(["a".to_string()].into());
        wait_until(|| !seen.lock().unwrap().is_empty()).await;

        subscription.update_resource_interest(["a".to_string(), "b".to_string()].into());
        wait_until(|| {
            seen.lock()
                .unwrap()
                .last()
                .is_some_and(|names| names.len() == 2)
        })
        .await;
    }

    #[cfg(feature = "rt-tokio")]
    #[tokio::test]
    async fn file_fetcher_versions_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.pb");
        std::fs::write(&path, b"first contents").unwrap();

        let mut fetcher = FileFetcher::new(&path, "type.googleapis.com/test.Resource");
        let first = fetcher.fetch(&BTreeSet::new()).await.unwrap();
        assert_eq!(first.resources.len(), 1);
        assert_eq!(first.resources[0].value.as_ref(), b"first contents");
        assert!(!first.version_info.is_empty());

        // Unchanged file, unchanged version.
        let again = fetcher.fetch(&BTreeSet::new()).await.unwrap();
        assert_eq!(again.version_info, first.version_info);

        std::fs::write(&path, b"second contents").unwrap();
        let second = fetcher.fetch(&BTreeSet::new()).await.unwrap();
        assert_ne!(second.version_info, first.version_info);

        // Missing file is a connection-class failure.
        let mut missing = FileFetcher::new(dir.path().join("gone.pb"), "t");
        assert!(missing.fetch(&BTreeSet::new()).await.is_err());
    }
}
