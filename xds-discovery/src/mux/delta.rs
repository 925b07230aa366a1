//! Incremental (delta) mux worker.
//!
//! Speaks the delta protocol: interest changes go out as
//! subscribe/unsubscribe diffs against the previously declared set, and
//! responses carry individually named and versioned resources plus explicit
//! removals. Per-resource versions are tracked so an unchanged resource is
//! not re-delivered, and are offered back to the server on reconnect so it
//! can skip a full resync.
//!
//! Watch bookkeeping, pause gating, nonce staleness, init-fetch timers, and
//! reconnect backoff all behave exactly as in the state-of-the-world worker.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::codec::DiscoveryCodec;
use crate::error::{Error, Result};
use crate::message::{DeltaDiscoveryRequest, DeltaDiscoveryResponse, DeltaResource, ErrorDetail, Node};
use crate::mux::retry::Backoff;
use crate::mux::watch::{TypePhase, WatchEntry, WatchId, WatchMap};
use crate::mux::{MuxCommand, MuxConfig};
use crate::runtime::Runtime;
use crate::subscription::ConfigUpdateFailureReason;
use crate::transport::{Transport, TransportStream};

/// gRPC status code carried in NACK error details.
const INVALID_ARGUMENT: i32 = 3;

/// Per-type protocol state for the delta protocol.
struct TypeState {
    watches: WatchMap,
    phase: TypePhase,
    /// System version from the last accepted response, informational.
    system_version_info: String,
    /// Per-resource versions from accepted updates. The authoritative record
    /// of what this client holds; never advanced by a NACKed update.
    resource_versions: BTreeMap<String, String>,
    /// Names declared to the server on this stream (wildcard spelled `*`).
    last_sent_interest: BTreeSet<String>,
    /// Nonce of the most recent outbound request. A response must echo this
    /// to be applied.
    sent_nonce: String,
    /// Nonce of the most recent applied response.
    received_nonce: String,
    pause_depth: u32,
    request_pending: bool,
    /// Responses received while paused, replayed FIFO on resume.
    buffered: VecDeque<DeltaDiscoveryResponse>,
}

impl TypeState {
    fn new() -> Self {
        Self {
            watches: WatchMap::default(),
            phase: TypePhase::Uninitialized,
            system_version_info: String::new(),
            resource_versions: BTreeMap::new(),
            last_sent_interest: BTreeSet::new(),
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

    /// Nonces, buffered data, and the declared-interest record are tied to
    /// the stream. Resource versions survive: they are offered back to the
    /// server as `initial_resource_versions`.
    fn reset_stream_state(&mut self) {
        self.sent_nonce.clear();
        self.received_nonce.clear();
        self.buffered.clear();
        self.last_sent_interest.clear();
        self.request_pending = false;
        self.phase = if self.watches.is_empty() {
            TypePhase::Uninitialized
        } else {
            TypePhase::Subscribing
        };
    }

    fn collapse(&mut self) {
        self.phase = TypePhase::Uninitialized;
        self.system_version_info.clear();
        self.resource_versions.clear();
        self.sent_nonce.clear();
        self.received_nonce.clear();
        self.request_pending = false;
        self.buffered.clear();
    }
}

/// The delta worker owns the stream and all type state.
pub(crate) struct DeltaWorker<T, C, R> {
    transport: T,
    codec: C,
    runtime: R,
    node: Node,
    backoff: Backoff,
    started: bool,
    command_tx: mpsc::WeakUnboundedSender<MuxCommand>,
    command_rx: mpsc::UnboundedReceiver<MuxCommand>,
    types: HashMap<String, TypeState>,
    watch_index: HashMap<WatchId, String>,
    init_timers: HashMap<WatchId, oneshot::Sender<()>>,
    nonce_counter: u64,
}

impl<T, C, R> DeltaWorker<T, C, R>
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

    /// Run the worker event loop; see the state-of-the-world worker for the
    /// lifecycle contract.
    pub(crate) async fn run(mut self) {
        loop {
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
            let stream = match self.transport.new_delta_stream(initial_requests).await {
                Ok(stream) => {
                    self.backoff.reset();
                    debug!("delta discovery stream established");
                    stream
                }
                Err(error) => {
                    warn!(%error, "failed to establish delta discovery stream");
                    self.notify_connection_failure();
                    match self.backoff.next_backoff() {
                        Some(delay) => self.runtime.sleep(delay).await,
                        None => return,
                    }
                    continue;
                }
            };

            match self.run_connected(stream).await {
                Ok(()) => return,
                Err(error) => {
                    warn!(%error, "delta discovery stream lost");
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

    /// Build the stream-establishing requests: full subscribe sets plus the
    /// versions of resources already held, one request per subscribed type.
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
                let interest = state.watches.interest().delta_names();
                state.last_sent_interest = interest;
                state.sent_nonce = nonce;
                state.request_pending = false;
                state.phase = TypePhase::Subscribing;
            }

            let state = &self.types[&type_url];
            let request = DeltaDiscoveryRequest {
                node: Some(&self.node),
                type_url: &type_url,
                resource_names_subscribe: state.last_sent_interest.iter().cloned().collect(),
                resource_names_unsubscribe: Vec::new(),
                initial_resource_versions: state
                    .resource_versions
                    .iter()
                    .map(|(name, version)| (name.clone(), version.clone()))
                    .collect(),
                response_nonce: &state.sent_nonce,
                error_detail: None,
            };

            if let Ok(bytes) = self.codec.encode_delta_request(&request) {
                requests.push(bytes);
            }
        }

        requests
    }

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
                    // Final request unsubscribing everything, then collapse.
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

    /// Send the diff between the declared and current interest, or mark the
    /// type pending if it cannot flush right now. Diffing at send time means
    /// rapid changes coalesce into one request for free.
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

        let interest = state.watches.interest().delta_names();
        let subscribe: Vec<String> = interest
            .difference(&state.last_sent_interest)
            .cloned()
            .collect();
        let unsubscribe: Vec<String> = state
            .last_sent_interest
            .difference(&interest)
            .cloned()
            .collect();

        state.request_pending = false;
        if subscribe.is_empty() && unsubscribe.is_empty() {
            return Ok(());
        }

        state.last_sent_interest = interest;
        state.sent_nonce = nonce;
        if state.phase == TypePhase::Uninitialized && !state.watches.is_empty() {
            state.phase = TypePhase::Subscribing;
        }

        let state = &self.types[type_url];
        let request = DeltaDiscoveryRequest {
            node: None,
            type_url,
            resource_names_subscribe: subscribe,
            resource_names_unsubscribe: unsubscribe,
            initial_resource_versions: Vec::new(),
            response_nonce: &state.sent_nonce,
            error_detail: None,
        };

        let bytes = self.codec.encode_delta_request(&request)?;
        stream.send(bytes).await
    }

    async fn handle_response<S: TransportStream>(
        &mut self,
        stream: &mut S,
        bytes: Bytes,
    ) -> Result<()> {
        let response = match self.codec.decode_delta_response(bytes) {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "dropping undecodable delta discovery response");
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
                "dropping stale delta response"
            );
            return Ok(());
        }
        if state.paused() {
            debug!(type_url = %response.type_url, "type paused, buffering delta response");
            state.buffered.push_back(response);
            return Ok(());
        }

        self.apply_response(Some(stream), response).await
    }

    /// Apply a (nonce-checked) delta response: dispatch the changed and
    /// removed resources to every watch and answer with an ACK or NACK.
    async fn apply_response<S: TransportStream>(
        &mut self,
        stream: Option<&mut S>,
        response: DeltaDiscoveryResponse,
    ) -> Result<()> {
        let type_url = response.type_url.clone();

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
        state.phase = TypePhase::Active;

        // Resources whose version we already hold are not re-delivered.
        let added: Vec<DeltaResource> = response
            .resources
            .into_iter()
            .filter(|resource| {
                state.resource_versions.get(&resource.name) != Some(&resource.version)
            })
            .collect();
        let removed = response.removed_resources;

        if added.is_empty() && removed.is_empty() {
            // Nothing changed hands; acknowledge for the bookkeeping alone.
            for (_, entry) in state.watches.iter_mut() {
                entry.received_update = true;
            }
            return self.send_ack_or_nack(stream, &type_url, None).await;
        }

        let mut errors: Vec<String> = Vec::new();
        for (_, entry) in state.watches.iter_mut() {
            entry.received_update = true;
            entry.stats.record_attempt();
            match entry.callbacks.on_delta_config_update(
                &added,
                &removed,
                &response.system_version_info,
            ) {
                Ok(()) => entry.stats.record_success(&response.system_version_info),
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

        if errors.is_empty() {
            for resource in &added {
                state
                    .resource_versions
                    .insert(resource.name.clone(), resource.version.clone());
            }
            for name in &removed {
                state.resource_versions.remove(name);
            }
            state.system_version_info = response.system_version_info.clone();
            debug!(
                %type_url,
                system_version = %state.system_version_info,
                nonce = %state.received_nonce,
                added = added.len(),
                removed = removed.len(),
                "delta update accepted"
            );
            self.send_ack_or_nack(stream, &type_url, None).await
        } else {
            let detail = errors.join("; ");
            warn!(%type_url, error = %detail, "delta update rejected");
            self.send_ack_or_nack(stream, &type_url, Some(detail)).await
        }
    }

    /// Send an ACK (no error) or NACK (with error detail). Delta ACKs carry
    /// no interest diff; a NACK leaves the per-resource versions untouched.
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
        let request = DeltaDiscoveryRequest {
            node: None,
            type_url,
            resource_names_subscribe: Vec::new(),
            resource_names_unsubscribe: Vec::new(),
            initial_resource_versions: Vec::new(),
            response_nonce: &state.sent_nonce,
            error_detail: error.map(|message| ErrorDetail {
                code: INVALID_ARGUMENT,
                message,
            }),
        };

        let bytes = self.codec.encode_delta_request(&request)?;
        stream.send(bytes).await
    }

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
