//! State-of-the-world mux worker.
//!
//! The worker runs as a background task, managing:
//! - The discovery stream lifecycle (connection, reconnection with backoff)
//! - Per-type interest sets, version/nonce tracking, pause gating
//! - Dispatching updates to watch callbacks
//! - ACK/NACK generation

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::codec::DiscoveryCodec;
use crate::error::{Error, Result};
use crate::message::{DiscoveryRequest, DiscoveryResponse, ErrorDetail, Node};
use crate::mux::retry::Backoff;
use crate::mux::watch::{TypePhase, WatchEntry, WatchId, WatchMap};
use crate::mux::{MuxCommand, MuxConfig};
use crate::runtime::Runtime;
use crate::subscription::ConfigUpdateFailureReason;
use crate::transport::{Transport, TransportStream};

/// gRPC status code carried in NACK error details.
const INVALID_ARGUMENT: i32 = 3;

/// Per-type protocol state.
struct TypeState {
    /// Live watches and their cached interest union.
    watches: WatchMap,
    /// Lifecycle of this type's subscription on the current stream.
    phase: TypePhase,
    /// Version from the last accepted response; sent on ACKs and carried on
    /// reconnect so the server may skip a full resync.
    version_info: String,
    /// Nonce of the most recent outbound request. A response must echo this
    /// to be applied.
    sent_nonce: String,
    /// Nonce of the most recent applied response.
    received_nonce: String,
    /// Pause nesting depth; nonzero gates flushing and application.
    pause_depth: u32,
    /// An interest change is waiting to be flushed once the type can send.
    request_pending: bool,
    /// Responses received while paused, replayed FIFO on resume.
    buffered: VecDeque<DiscoveryResponse>,
}

impl TypeState {
    fn new() -> Self {
        Self {
            watches: WatchMap::default(),
            phase: TypePhase::Uninitialized,
            version_info: String::new(),
            sent_nonce: String::new(),
            received_nonce: String::new(),
            pause_depth: 0,
            request_pending: false,
            buffered: VecDeque::new(),
        }
    }

    fn paused(&self) -> bool {
        self.pause_depth > 0
    }

    /// Nonces and buffered data are tied to the stream; called on every
    /// (re)connect.
    fn reset_stream_state(&mut self) {
        self.sent_nonce.clear();
        self.received_nonce.clear();
        self.buffered.clear();
        self.request_pending = false;
        self.phase = if self.watches.is_empty() {
            TypePhase::Uninitialized
        } else {
            TypePhase::Subscribing
        };
    }

    /// The last watch is gone: back to Uninitialized. The pause gate is
    /// owned by pause()/resume() callers and survives the collapse.
    fn collapse(&mut self) {
        self.phase = TypePhase::Uninitialized;
        self.version_info.clear();
        self.sent_nonce.clear();
        self.received_nonce.clear();
        self.request_pending = false;
        self.buffered.clear();
    }
}

/// The state-of-the-world worker owns the stream and all type state.
pub(crate) struct SotwWorker<T, C, R> {
    transport: T,
    codec: C,
    runtime: R,
    node: Node,
    backoff: Backoff,
    /// Set by `GrpcMux::start`; the worker will not connect before it.
    started: bool,
    /// For timer callbacks; weak so held timers never keep the worker alive.
    command_tx: mpsc::WeakUnboundedSender<MuxCommand>,
    command_rx: mpsc::UnboundedReceiver<MuxCommand>,
    /// Per-type state, keyed by type URL. Entries are created on first use
    /// and reclaimed only when the worker shuts down.
    types: HashMap<String, TypeState>,
    /// Reverse index from watch to its type.
    watch_index: HashMap<WatchId, String>,
    /// Cancellation handles for armed init-fetch timers.
    init_timers: HashMap<WatchId, oneshot::Sender<()>>,
    /// Source of fresh per-request nonces.
    nonce_counter: u64,
}

impl<T, C, R> SotwWorker<T, C, R>
where
    T: Transport,
    C: DiscoveryCodec,
    R: Runtime,
{
    pub(crate) fn new(
        transport: T,
        codec: C,
        runtime: R,
        config: MuxConfig,
        command_tx: mpsc::WeakUnboundedSender<MuxCommand>,
        command_rx: mpsc::UnboundedReceiver<MuxCommand>,
    ) -> Self {
        Self {
            transport,
            codec,
            runtime,
            node: config.node,
            backoff: Backoff::new(config.retry_policy),
            started: false,
            command_tx,
            command_rx,
            types: HashMap::new(),
            watch_index: HashMap::new(),
            init_timers: HashMap::new(),
            nonce_counter: 0,
        }
    }

    /// Run the worker event loop.
    ///
    /// Runs until all `GrpcMux` handles are dropped (which closes the
    /// command channel) or the retry policy is exhausted.
    pub(crate) async fn run(mut self) {
        loop {
            // Idle until started and at least one watch exists. Connecting
            // with nothing to send would deadlock servers that withhold
            // response headers until the first request.
            while !self.started || !self.has_active_interest() {
                match self.command_rx.recv().await {
                    Some(command) => {
                        let _ = self.handle_command::<T::Stream>(None, command).await;
                    }
                    None => return,
                }
            }

            for state in self.types.values_mut() {
                state.reset_stream_state();
            }

            let initial_requests = self.build_initial_requests();
            let stream = match self.transport.new_stream(initial_requests).await {
                Ok(stream) => {
                    self.backoff.reset();
                    debug!("discovery stream established");
                    stream
                }
                Err(error) => {
                    warn!(%error, "failed to establish discovery stream");
                    self.notify_connection_failure();
                    match self.backoff.next_backoff() {
                        Some(delay) => self.runtime.sleep(delay).await,
                        None => return,
                    }
                    continue;
                }
            };

            match self.run_connected(stream).await {
                Ok(()) => return, // all handles dropped
                Err(error) => {
                    warn!(%error, "discovery stream lost");
                    self.notify_connection_failure();
                    match self.backoff.next_backoff() {
                        Some(delay) => self.runtime.sleep(delay).await,
                        None => return,
                    }
                }
            }
        }
    }

    fn has_active_interest(&self) -> bool {
        self.types.values().any(|state| !state.watches.is_empty())
    }

    fn next_nonce(&mut self) -> String {
        self.nonce_counter += 1;
        self.nonce_counter.to_string()
    }

    /// Build the requests flushed while establishing the stream, one per
    /// type with live watches, each carrying the last accepted version.
    fn build_initial_requests(&mut self) -> Vec<Bytes> {
        let type_urls: Vec<String> = self
            .types
            .iter()
            .filter(|(_, state)| !state.watches.is_empty())
            .map(|(type_url, _)| type_url.clone())
            .collect();

        let mut requests = Vec::with_capacity(type_urls.len());
        for type_url in type_urls {
            let nonce = self.next_nonce();
            if let Some(state) = self.types.get_mut(&type_url) {
                state.sent_nonce = nonce;
                state.request_pending = false;
                state.phase = TypePhase::Subscribing;
            }

            let state = &self.types[&type_url];
            let resource_names = state.watches.resource_names_for_request();
            let request = DiscoveryRequest {
                version_info: &state.version_info,
                node: &self.node,
                resource_names: &resource_names,
                type_url: &type_url,
                response_nonce: &state.sent_nonce,
                error_detail: None,
            };

            if let Ok(bytes) = self.codec.encode_request(&request) {
                requests.push(bytes);
            }
        }

        requests
    }

    /// Run the main event loop while connected.
    ///
    /// Returns `Ok(())` if the worker should shut down (command channel
    /// closed). Returns `Err` if the stream failed and the worker should
    /// reconnect.
    async fn run_connected<S: TransportStream>(&mut self, mut stream: S) -> Result<()> {
        loop {
            tokio::select! {
                result = stream.recv() => {
                    match result {
                        Ok(Some(bytes)) => {
                            self.handle_response(&mut stream, bytes).await?;
                        }
                        Ok(None) => return Err(Error::StreamClosed),
                        Err(error) => return Err(error),
                    }
                }

                command = self.command_rx.recv() => {
                    match command {
                        Some(command) => {
                            self.handle_command(Some(&mut stream), command).await?;
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Handle a command, optionally flushing requests if connected.
    ///
    /// When `stream` is `None` only state updates are performed; pending
    /// requests are flushed on reconnect.
    async fn handle_command<S: TransportStream>(
        &mut self,
        mut stream: Option<&mut S>,
        command: MuxCommand,
    ) -> Result<()> {
        match command {
            MuxCommand::Start => {
                self.started = true;
            }
            MuxCommand::AddWatch {
                type_url,
                watch,
                resource_names,
                callbacks,
                stats,
                init_fetch_timeout,
            } => {
                let state = self.types.entry(type_url.clone()).or_insert_with(TypeState::new);
                let changed = state.watches.insert(
                    watch,
                    WatchEntry {
                        resource_names,
                        callbacks,
                        stats,
                        received_update: false,
                    },
                );
                self.watch_index.insert(watch, type_url.clone());

                if let Some(timeout) = init_fetch_timeout {
                    if !timeout.is_zero() {
                        self.arm_init_fetch_timer(&type_url, watch, timeout);
                    }
                }

                if changed {
                    self.flush_request(stream, &type_url).await?;
                }
            }
            MuxCommand::UpdateWatch {
                watch,
                resource_names,
            } => {
                let Some(type_url) = self.watch_index.get(&watch).cloned() else {
                    return Ok(());
                };
                let Some(state) = self.types.get_mut(&type_url) else {
                    return Ok(());
                };
                if state.watches.update_names(watch, resource_names) {
                    self.flush_request(stream, &type_url).await?;
                }
            }
            MuxCommand::RemoveWatch { watch } => {
                let Some(type_url) = self.watch_index.remove(&watch) else {
                    return Ok(());
                };
                self.init_timers.remove(&watch);
                let Some(state) = self.types.get_mut(&type_url) else {
                    return Ok(());
                };
                let (_, changed) = state.watches.remove(watch);
                if state.watches.is_empty() {
                    // Final unsubscribe-all request, then back to Uninitialized.
                    self.flush_request(stream, &type_url).await?;
                    if let Some(state) = self.types.get_mut(&type_url) {
                        let pending = state.request_pending;
                        state.collapse();
                        state.request_pending = pending;
                    }
                } else if changed {
                    self.flush_request(stream, &type_url).await?;
                }
            }
            MuxCommand::Pause { type_url } => {
                let state = self.types.entry(type_url.clone()).or_insert_with(TypeState::new);
                state.pause_depth += 1;
                debug!(%type_url, depth = state.pause_depth, "type paused");
            }
            MuxCommand::Resume { type_url } => {
                self.resume_type(stream.as_deref_mut(), &type_url).await?;
            }
            MuxCommand::QueryPaused { type_url, reply } => {
                let paused = self.types.get(&type_url).is_some_and(TypeState::paused);
                let _ = reply.send(paused);
            }
            MuxCommand::InitFetchTimerExpired { type_url, watch } => {
                self.handle_init_fetch_timeout(&type_url, watch);
            }
        }
        Ok(())
    }

    /// Send the type's current interest to the server, or mark it pending
    /// if the type cannot flush right now (paused or disconnected).
    async fn flush_request<S: TransportStream>(
        &mut self,
        stream: Option<&mut S>,
        type_url: &str,
    ) -> Result<()> {
        let nonce = self.next_nonce();
        let Some(state) = self.types.get_mut(type_url) else {
            return Ok(());
        };

        let Some(stream) = stream else {
            state.request_pending = true;
            return Ok(());
        };
        if state.paused() {
            state.request_pending = true;
            return Ok(());
        }

        state.sent_nonce = nonce;
        state.request_pending = false;
        if state.phase == TypePhase::Uninitialized && !state.watches.is_empty() {
            state.phase = TypePhase::Subscribing;
        }

        let state = &self.types[type_url];
        let resource_names = state.watches.resource_names_for_request();
        let request = DiscoveryRequest {
            version_info: &state.version_info,
            node: &self.node,
            resource_names: &resource_names,
            type_url,
            response_nonce: &state.sent_nonce,
            error_detail: None,
        };

        let bytes = self.codec.encode_request(&request)?;
        stream.send(bytes).await
    }

    /// Handle a response from the server.
    async fn handle_response<S: TransportStream>(
        &mut self,
        stream: &mut S,
        bytes: Bytes,
    ) -> Result<()> {
        let response = match self.codec.decode_response(bytes) {
            Ok(response) => response,
            Err(error) => {
                // Malformed envelope: drop it, the stream itself is healthy.
                warn!(%error, "dropping undecodable discovery response");
                return Ok(());
            }
        };

        let Some(state) = self.types.get_mut(&response.type_url) else {
            debug!(type_url = %response.type_url, "response for unknown type");
            return Ok(());
        };
        if state.watches.is_empty() {
            debug!(type_url = %response.type_url, "response for type with no watches");
            return Ok(());
        }
        if response.nonce != state.sent_nonce {
            debug!(
                type_url = %response.type_url,
                nonce = %response.nonce,
                expected = %state.sent_nonce,
                "dropping stale response"
            );
            return Ok(());
        }
        if state.paused() {
            debug!(type_url = %response.type_url, "type paused, buffering response");
            state.buffered.push_back(response);
            return Ok(());
        }

        self.apply_response(Some(stream), response).await
    }

    /// Apply a (nonce-checked) response: dispatch to every watch of the
    /// type and answer with an ACK or NACK.
    async fn apply_response<S: TransportStream>(
        &mut self,
        stream: Option<&mut S>,
        response: DiscoveryResponse,
    ) -> Result<()> {
        let type_url = response.type_url.clone();

        // Any applied update for the type disarms its init-fetch timers.
        let ids = match self.types.get(&type_url) {
            Some(state) => state.watches.ids(),
            None => return Ok(()),
        };
        for watch in &ids {
            self.init_timers.remove(watch);
        }

        let Some(state) = self.types.get_mut(&type_url) else {
            return Ok(());
        };
        state.received_nonce = response.nonce.clone();

        let mut errors: Vec<String> = Vec::new();
        for (_, entry) in state.watches.iter_mut() {
            entry.received_update = true;
            entry.stats.record_attempt();
            match entry
                .callbacks
                .on_config_update(&response.resources, &response.version_info)
            {
                Ok(()) => entry.stats.record_success(&response.version_info),
                Err(error) => {
                    entry.stats.record_rejected();
                    entry.callbacks.on_config_update_failed(
                        ConfigUpdateFailureReason::UpdateRejected,
                        Some(&error),
                    );
                    errors.push(error.message);
                }
            }
        }
        state.phase = TypePhase::Active;

        if errors.is_empty() {
            state.version_info = response.version_info.clone();
            debug!(
                %type_url,
                version = %response.version_info,
                nonce = %state.received_nonce,
                "update accepted"
            );
            self.send_ack_or_nack(stream, &type_url, None).await
        } else {
            let detail = errors.join("; ");
            warn!(%type_url, error = %detail, "update rejected");
            self.send_ack_or_nack(stream, &type_url, Some(detail)).await
        }
    }

    /// Send an ACK (no error) or NACK (with error detail) for the type.
    ///
    /// The request carries the type's acknowledged version: on ACK it was
    /// just advanced; on NACK it still holds the last accepted version.
    async fn send_ack_or_nack<S: TransportStream>(
        &mut self,
        stream: Option<&mut S>,
        type_url: &str,
        error: Option<String>,
    ) -> Result<()> {
        let Some(stream) = stream else {
            return Ok(());
        };
        let nonce = self.next_nonce();
        let Some(state) = self.types.get_mut(type_url) else {
            return Ok(());
        };
        state.sent_nonce = nonce;

        let state = &self.types[type_url];
        let resource_names = state.watches.resource_names_for_request();
        let request = DiscoveryRequest {
            version_info: &state.version_info,
            node: &self.node,
            resource_names: &resource_names,
            type_url,
            response_nonce: &state.sent_nonce,
            error_detail: error.map(|message| ErrorDetail {
                code: INVALID_ARGUMENT,
                message,
            }),
        };

        let bytes = self.codec.encode_request(&request)?;
        stream.send(bytes).await
    }

    /// Undo one pause; at depth zero replay buffered responses in arrival
    /// order, then flush any coalesced interest change.
    async fn resume_type<S: TransportStream>(
        &mut self,
        mut stream: Option<&mut S>,
        type_url: &str,
    ) -> Result<()> {
        let Some(state) = self.types.get_mut(type_url) else {
            debug_assert!(false, "resume() without a matching pause()");
            return Ok(());
        };
        debug_assert!(state.pause_depth > 0, "resume() without a matching pause()");
        state.pause_depth = state.pause_depth.saturating_sub(1);
        if state.paused() {
            return Ok(());
        }
        debug!(type_url, "type resumed");

        loop {
            let buffered = self
                .types
                .get_mut(type_url)
                .and_then(|state| state.buffered.pop_front());
            match buffered {
                Some(response) => self.apply_response(stream.as_deref_mut(), response).await?,
                None => break,
            }
        }

        let pending = self
            .types
            .get(type_url)
            .is_some_and(|state| state.request_pending);
        if pending {
            self.flush_request(stream, type_url).await?;
        }
        Ok(())
    }

    /// Surface a transport failure to every watch of every subscribed type.
    fn notify_connection_failure(&mut self) {
        for state in self.types.values_mut() {
            for (_, entry) in state.watches.iter_mut() {
                entry.stats.record_failure();
                entry
                    .callbacks
                    .on_config_update_failed(ConfigUpdateFailureReason::ConnectionFailure, None);
            }
        }
    }

    /// Arm the init-fetch timer for a freshly added watch.
    ///
    /// When it fires the worker receives a command; the handler checks the
    /// watch is still waiting before reporting, so cancellation is a matter
    /// of dropping the handle.
    fn arm_init_fetch_timer(&mut self, type_url: &str, watch: WatchId, timeout: Duration) {
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let command_tx = self.command_tx.clone();
        let runtime = self.runtime.clone();
        let type_url = type_url.to_string();

        self.runtime.spawn(async move {
            tokio::select! {
                _ = runtime.sleep(timeout) => {
                    if let Some(command_tx) = command_tx.upgrade() {
                        let _ = command_tx.send(MuxCommand::InitFetchTimerExpired { type_url, watch });
                    }
                }
                _ = cancel_rx => {}
            }
        });

        self.init_timers.insert(watch, cancel_tx);
    }

    /// Report an expired init-fetch timer, unless an update arrived first.
    fn handle_init_fetch_timeout(&mut self, type_url: &str, watch: WatchId) {
        self.init_timers.remove(&watch);

        let Some(state) = self.types.get_mut(type_url) else {
            return;
        };
        let Some(entry) = state.watches.get_mut(watch) else {
            return;
        };
        if entry.received_update {
            return;
        }

        warn!(type_url, "no configuration received within the init fetch timeout");
        entry.stats.record_init_fetch_timeout();
        entry
            .callbacks
            .on_config_update_failed(ConfigUpdateFailureReason::FetchTimedOut, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::prost::ProstCodec;
    use crate::mux::retry::RetryPolicy;
    use crate::mux::{GrpcMux, MuxCommand};
    use crate::runtime::tokio::TokioRuntime;
    use crate::stats::SubscriptionStats;
    use crate::subscription::{ConfigUpdateError, SubscriptionCallbacks};
    use envoy_types::pb::envoy::service::discovery::v3 as discovery;
    use envoy_types::pb::google::protobuf::Any;
    use prost::Message as _;
    use std::collections::BTreeSet;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};

    const CLUSTER: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Update { version: String, resources: usize },
        Failed { reason: ConfigUpdateFailureReason },
    }

    type EventLog = Arc<Mutex<Vec<Event>>>;

    struct RecordingCallbacks {
        events: EventLog,
        reject_with: Arc<Mutex<Option<String>>>,
    }

    impl SubscriptionCallbacks for RecordingCallbacks {
        fn on_config_update(
            &mut self,
            resources: &[crate::message::ResourceAny],
            version_info: &str,
        ) -> std::result::Result<(), ConfigUpdateError> {
            self.events.lock().unwrap().push(Event::Update {
                version: version_info.to_string(),
                resources: resources.len(),
            });
            match self.reject_with.lock().unwrap().as_ref() {
                Some(message) => Err(ConfigUpdateError::new(message.clone())),
                None => Ok(()),
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

    /// Records sent requests; never yields a response.
    #[derive(Default)]
    struct ScriptStream {
        sent: Vec<Bytes>,
    }

    impl TransportStream for ScriptStream {
        async fn send(&mut self, request: Bytes) -> crate::error::Result<()> {
            self.sent.push(request);
            Ok(())
        }

        async fn recv(&mut self) -> crate::error::Result<Option<Bytes>> {
            Ok(None)
        }
    }

    struct NullTransport;

    impl Transport for NullTransport {
        type Stream = ScriptStream;

        async fn new_stream(&self, _initial: Vec<Bytes>) -> crate::error::Result<Self::Stream> {
            Ok(ScriptStream::default())
        }

        async fn new_delta_stream(
            &self,
            _initial: Vec<Bytes>,
        ) -> crate::error::Result<Self::Stream> {
            Ok(ScriptStream::default())
        }
    }

    /// Fails every connection attempt.
    struct FailTransport;

    impl Transport for FailTransport {
        type Stream = ScriptStream;

        async fn new_stream(&self, _initial: Vec<Bytes>) -> crate::error::Result<Self::Stream> {
            Err(Error::Connection("refused".into()))
        }

        async fn new_delta_stream(
            &self,
            _initial: Vec<Bytes>,
        ) -> crate::error::Result<Self::Stream> {
            Err(Error::Connection("refused".into()))
        }
    }

    type TestWorker = SotwWorker<NullTransport, ProstCodec, TokioRuntime>;

    fn worker() -> (TestWorker, mpsc::UnboundedSender<MuxCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let worker = SotwWorker::new(
            NullTransport,
            ProstCodec,
            TokioRuntime,
            MuxConfig::new(Node::new("test", "0")),
            command_tx.downgrade(),
            command_rx,
        );
        (worker, command_tx)
    }

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn add_watch(
        worker: &mut TestWorker,
        stream: &mut ScriptStream,
        resource_names: &[&str],
        reject_with: Arc<Mutex<Option<String>>>,
        init_fetch_timeout: Option<Duration>,
    ) -> (WatchId, EventLog, Arc<SubscriptionStats>) {
        let events: EventLog = Arc::default();
        let stats = Arc::new(SubscriptionStats::new());
        let watch = WatchId::new();
        let command = MuxCommand::AddWatch {
            type_url: CLUSTER.to_string(),
            watch,
            resource_names: names(resource_names),
            callbacks: Box::new(RecordingCallbacks {
                events: Arc::clone(&events),
                reject_with,
            }),
            stats: Arc::clone(&stats),
            init_fetch_timeout,
        };
        worker.handle_command(Some(stream), command).await.unwrap();
        (watch, events, stats)
    }

    fn last_request(stream: &ScriptStream) -> discovery::DiscoveryRequest {
        let bytes = stream.sent.last().expect("no request sent").clone();
        discovery::DiscoveryRequest::decode(bytes).unwrap()
    }

    fn response_bytes(version: &str, nonce: &str, resources: usize) -> Bytes {
        let resources = (0..resources)
            .map(|i| Any {
                type_url: CLUSTER.to_string(),
                value: format!("resource-{i}").into_bytes(),
            })
            .collect();
        discovery::DiscoveryResponse {
            version_info: version.to_string(),
            type_url: CLUSTER.to_string(),
            nonce: nonce.to_string(),
            resources,
            ..Default::default()
        }
        .encode_to_vec()
        .into()
    }

    async fn respond(
        worker: &mut TestWorker,
        stream: &mut ScriptStream,
        version: &str,
        resources: usize,
    ) {
        let nonce = worker.types[CLUSTER].sent_nonce.clone();
        worker
            .handle_response(stream, response_bytes(version, &nonce, resources))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn subscribe_then_ack() {
        let (mut worker, _tx) = worker();
        let mut stream = ScriptStream::default();
        let (_, events, stats) =
            add_watch(&mut worker, &mut stream, &["A"], Arc::default(), None).await;

        let request = last_request(&stream);
        assert_eq!(request.type_url, CLUSTER);
        assert_eq!(request.resource_names, vec!["A"]);
        assert_eq!(request.version_info, "");
        assert!(!request.response_nonce.is_empty());

        respond(&mut worker, &mut stream, "1", 1).await;

        assert_eq!(
            *events.lock().unwrap(),
            vec![Event::Update {
                version: "1".into(),
                resources: 1
            }]
        );

        let ack = last_request(&stream);
        assert_eq!(ack.version_info, "1");
        assert_eq!(ack.resource_names, vec!["A"]);
        assert!(ack.error_detail.is_none());
        assert_ne!(ack.response_nonce, request.response_nonce);

        assert_eq!(stats.update_attempt.load(Ordering::Relaxed), 1);
        assert_eq!(stats.update_success.load(Ordering::Relaxed), 1);
        assert_eq!(worker.types[CLUSTER].phase, TypePhase::Active);
    }

    #[tokio::test]
    async fn two_watches_merge_into_one_request() {
        let (mut worker, _tx) = worker();
        let mut stream = ScriptStream::default();
        add_watch(&mut worker, &mut stream, &["A"], Arc::default(), None).await;
        add_watch(&mut worker, &mut stream, &["B"], Arc::default(), None).await;

        let request = last_request(&stream);
        assert_eq!(request.resource_names, vec!["A", "B"]);
        assert_eq!(stream.sent.len(), 2);
    }

    #[tokio::test]
    async fn stale_nonce_is_dropped_silently() {
        let (mut worker, _tx) = worker();
        let mut stream = ScriptStream::default();
        let (_, events, stats) =
            add_watch(&mut worker, &mut stream, &["A"], Arc::default(), None).await;
        let sent_before = stream.sent.len();

        worker
            .handle_response(&mut stream, response_bytes("1", "bogus-nonce", 1))
            .await
            .unwrap();

        assert!(events.lock().unwrap().is_empty());
        assert_eq!(stream.sent.len(), sent_before);
        assert_eq!(stats.update_attempt.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn response_after_last_watch_removed_is_discarded() {
        let (mut worker, _tx) = worker();
        let mut stream = ScriptStream::default();
        let (watch, events, _) =
            add_watch(&mut worker, &mut stream, &["A"], Arc::default(), None).await;
        let nonce = worker.types[CLUSTER].sent_nonce.clone();

        worker
            .handle_command(Some(&mut stream), MuxCommand::RemoveWatch { watch })
            .await
            .unwrap();

        // The final request unsubscribes and the type is back to square one.
        let request = last_request(&stream);
        assert!(request.resource_names.is_empty());
        assert_eq!(worker.types[CLUSTER].phase, TypePhase::Uninitialized);

        let sent_before = stream.sent.len();
        worker
            .handle_response(&mut stream, response_bytes("1", &nonce, 1))
            .await
            .unwrap();
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(stream.sent.len(), sent_before);
    }

    #[tokio::test]
    async fn removing_one_of_two_watches_narrows_the_request() {
        let (mut worker, _tx) = worker();
        let mut stream = ScriptStream::default();
        let (watch_a, _, _) =
            add_watch(&mut worker, &mut stream, &["A"], Arc::default(), None).await;
        add_watch(&mut worker, &mut stream, &["B"], Arc::default(), None).await;

        worker
            .handle_command(Some(&mut stream), MuxCommand::RemoveWatch { watch: watch_a })
            .await
            .unwrap();

        let request = last_request(&stream);
        assert_eq!(request.resource_names, vec!["B"]);
    }

    #[tokio::test]
    async fn nack_preserves_acknowledged_version() {
        let (mut worker, _tx) = worker();
        let mut stream = ScriptStream::default();
        let reject = Arc::new(Mutex::new(None));
        let (_, events, stats) =
            add_watch(&mut worker, &mut stream, &["A"], Arc::clone(&reject), None).await;

        respond(&mut worker, &mut stream, "1", 1).await;
        assert_eq!(worker.types[CLUSTER].version_info, "1");

        *reject.lock().unwrap() = Some("bad cluster config".to_string());
        respond(&mut worker, &mut stream, "2", 1).await;

        // Version unchanged, NACK on the wire with error detail.
        assert_eq!(worker.types[CLUSTER].version_info, "1");
        let nack = last_request(&stream);
        assert_eq!(nack.version_info, "1");
        let error = nack.error_detail.unwrap();
        assert_eq!(error.code, INVALID_ARGUMENT);
        assert_eq!(error.message, "bad cluster config");

        assert_eq!(
            events.lock().unwrap().last(),
            Some(&Event::Failed {
                reason: ConfigUpdateFailureReason::UpdateRejected
            })
        );
        assert_eq!(stats.update_rejected.load(Ordering::Relaxed), 1);
        assert_eq!(stats.version(), crate::stats::version_hash("1"));

        // A later good update still applies on top of the retained version.
        *reject.lock().unwrap() = None;
        respond(&mut worker, &mut stream, "3", 1).await;
        assert_eq!(worker.types[CLUSTER].version_info, "3");
    }

    #[tokio::test]
    async fn pause_buffers_responses_and_replays_in_order() {
        let (mut worker, _tx) = worker();
        let mut stream = ScriptStream::default();
        let (_, events, _) =
            add_watch(&mut worker, &mut stream, &["A"], Arc::default(), None).await;

        worker
            .handle_command(
                Some(&mut stream),
                MuxCommand::Pause {
                    type_url: CLUSTER.to_string(),
                },
            )
            .await
            .unwrap();

        respond(&mut worker, &mut stream, "1", 1).await;
        respond(&mut worker, &mut stream, "2", 2).await;
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(worker.types[CLUSTER].buffered.len(), 2);

        worker
            .handle_command(
                Some(&mut stream),
                MuxCommand::Resume {
                    type_url: CLUSTER.to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                Event::Update {
                    version: "1".into(),
                    resources: 1
                },
                Event::Update {
                    version: "2".into(),
                    resources: 2
                },
            ]
        );
        // Both replayed updates were ACKed; the last carries version 2.
        assert_eq!(last_request(&stream).version_info, "2");
    }

    #[tokio::test]
    async fn pause_nests_via_depth_counter() {
        let (mut worker, _tx) = worker();
        let mut stream = ScriptStream::default();
        add_watch(&mut worker, &mut stream, &["A"], Arc::default(), None).await;

        for _ in 0..2 {
            worker
                .handle_command(
                    Some(&mut stream),
                    MuxCommand::Pause {
                        type_url: CLUSTER.to_string(),
                    },
                )
                .await
                .unwrap();
        }
        worker
            .handle_command(
                Some(&mut stream),
                MuxCommand::Resume {
                    type_url: CLUSTER.to_string(),
                },
            )
            .await
            .unwrap();
        assert!(query_paused(&mut worker, &mut stream).await);

        worker
            .handle_command(
                Some(&mut stream),
                MuxCommand::Resume {
                    type_url: CLUSTER.to_string(),
                },
            )
            .await
            .unwrap();
        assert!(!query_paused(&mut worker, &mut stream).await);
    }

    async fn query_paused(worker: &mut TestWorker, stream: &mut ScriptStream) -> bool {
        let (reply, rx) = tokio::sync::oneshot::channel();
        worker
            .handle_command(
                Some(stream),
                MuxCommand::QueryPaused {
                    type_url: CLUSTER.to_string(),
                    reply,
                },
            )
            .await
            .unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn interest_changes_while_paused_coalesce_into_one_request() {
        let (mut worker, _tx) = worker();
        let mut stream = ScriptStream::default();
        let (watch, _, _) =
            add_watch(&mut worker, &mut stream, &["A"], Arc::default(), None).await;

        worker
            .handle_command(
                Some(&mut stream),
                MuxCommand::Pause {
                    type_url: CLUSTER.to_string(),
                },
            )
            .await
            .unwrap();

        let sent_before = stream.sent.len();
        for step in [vec!["A", "B"], vec!["A", "B", "C"]] {
            worker
                .handle_command(
                    Some(&mut stream),
                    MuxCommand::UpdateWatch {
                        watch,
                        resource_names: step.iter().map(|s| s.to_string()).collect(),
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(stream.sent.len(), sent_before);

        worker
            .handle_command(
                Some(&mut stream),
                MuxCommand::Resume {
                    type_url: CLUSTER.to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(stream.sent.len(), sent_before + 1);
        assert_eq!(last_request(&stream).resource_names, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn unchanged_interest_does_not_request() {
        let (mut worker, _tx) = worker();
        let mut stream = ScriptStream::default();
        let (watch, _, _) =
            add_watch(&mut worker, &mut stream, &["A"], Arc::default(), None).await;
        let sent_before = stream.sent.len();

        worker
            .handle_command(
                Some(&mut stream),
                MuxCommand::UpdateWatch {
                    watch,
                    resource_names: names(&["A"]),
                },
            )
            .await
            .unwrap();

        assert_eq!(stream.sent.len(), sent_before);
    }

    #[tokio::test(start_paused = true)]
    async fn init_fetch_timeout_fires_exactly_once() {
        let (mut worker, _tx) = worker();
        let mut stream = ScriptStream::default();
        let (_, events, stats) = add_watch(
            &mut worker,
            &mut stream,
            &["A"],
            Arc::default(),
            Some(Duration::from_millis(50)),
        )
        .await;

        // The paused clock advances once the test is otherwise idle, firing
        // the timer task, which reports back through the command channel.
        let command = worker.command_rx.recv().await.unwrap();
        worker
            .handle_command(Some(&mut stream), command)
            .await
            .unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec![Event::Failed {
                reason: ConfigUpdateFailureReason::FetchTimedOut
            }]
        );
        assert_eq!(stats.init_fetch_timeout.load(Ordering::Relaxed), 1);

        // A late response still applies normally.
        respond(&mut worker, &mut stream, "1", 1).await;
        assert_eq!(
            events.lock().unwrap().last(),
            Some(&Event::Update {
                version: "1".into(),
                resources: 1
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn init_fetch_timer_canceled_by_update() {
        let (mut worker, _tx) = worker();
        let mut stream = ScriptStream::default();
        let (_, events, stats) = add_watch(
            &mut worker,
            &mut stream,
            &["A"],
            Arc::default(),
            Some(Duration::from_millis(50)),
        )
        .await;

        respond(&mut worker, &mut stream, "1", 1).await;

        // Give the (canceled) timer task a chance to misbehave.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(worker.command_rx.try_recv().is_err());
        assert_eq!(stats.init_fetch_timeout.load(Ordering::Relaxed), 0);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn initial_requests_carry_acked_version() {
        let (mut worker, _tx) = worker();
        let mut stream = ScriptStream::default();
        add_watch(&mut worker, &mut stream, &["A"], Arc::default(), None).await;
        respond(&mut worker, &mut stream, "7", 1).await;

        // Simulate a reconnect: stream state resets, interest is resent
        // with the last acknowledged version.
        for state in worker.types.values_mut() {
            state.reset_stream_state();
        }
        let requests = worker.build_initial_requests();
        assert_eq!(requests.len(), 1);
        let request = discovery::DiscoveryRequest::decode(requests[0].clone()).unwrap();
        assert_eq!(request.resource_names, vec!["A"]);
        assert_eq!(request.version_info, "7");
        assert_eq!(worker.types[CLUSTER].phase, TypePhase::Subscribing);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_reports_and_backs_off() {
        let events: EventLog = Arc::default();
        let stats = Arc::new(SubscriptionStats::new());

        let config = MuxConfig::new(Node::new("test", "0")).with_retry_policy(
            RetryPolicy::new(
                Duration::from_millis(10),
                Duration::from_millis(100),
                2.0,
            )
            .unwrap()
            .with_max_attempts(Some(2)),
        );
        let mux = GrpcMux::builder(config, FailTransport, ProstCodec, TokioRuntime).build();

        mux.add_subscription(
            names(&["A"]),
            CLUSTER,
            Box::new(RecordingCallbacks {
                events: Arc::clone(&events),
                reject_with: Arc::default(),
            }),
            Arc::clone(&stats),
            None,
        );
        mux.start();

        // Two attempts, then the policy is exhausted.
        while stats.update_failure.load(Ordering::Relaxed) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(
            events
                .lock()
                .unwrap()
                .iter()
                .all(|e| *e == Event::Failed {
                    reason: ConfigUpdateFailureReason::ConnectionFailure
                })
        );
    }
}
