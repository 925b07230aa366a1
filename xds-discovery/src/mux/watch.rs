//! Watch handles and per-type resource-interest bookkeeping.
//!
//! The mux owns the authoritative per-type interest set; a [`WatchId`] is a
//! lightweight mux-issued token, never a back-pointer, so removal is a
//! bounded lookup rather than pointer invalidation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::stats::SubscriptionStats;
use crate::subscription::SubscriptionCallbacks;

/// Global counter for generating unique watch IDs.
static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a watch registered with a mux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

impl WatchId {
    /// Create a new unique watch ID.
    pub(crate) fn new() -> Self {
        Self(NEXT_WATCH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The merged subscription interest of one resource type.
///
/// A watch with an empty name set is a wildcard watch; any wildcard watch
/// widens the whole type to wildcard. On the wire a wildcard subscription is
/// an empty `resource_names` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InterestSet {
    /// Receive all resources of this type.
    Wildcard,
    /// Receive only the named resources.
    Named(BTreeSet<String>),
}

impl InterestSet {
    /// Resource names to carry in an outbound request.
    pub(crate) fn resource_names_for_request(&self) -> Vec<String> {
        match self {
            Self::Wildcard => Vec::new(),
            Self::Named(names) => names.iter().cloned().collect(),
        }
    }

    /// Names for a delta subscribe list, where wildcard is the literal `*`.
    pub(crate) fn delta_names(&self) -> BTreeSet<String> {
        match self {
            Self::Wildcard => std::iter::once("*".to_string()).collect(),
            Self::Named(names) => names.clone(),
        }
    }
}

/// One consumer's registration against a type.
pub(crate) struct WatchEntry {
    /// This watch's private contribution to the type's interest union.
    /// Empty means wildcard.
    pub(crate) resource_names: BTreeSet<String>,
    /// Where updates for this watch are delivered.
    pub(crate) callbacks: Box<dyn SubscriptionCallbacks>,
    /// Per-subscription counters, shared with the watch creator.
    pub(crate) stats: Arc<SubscriptionStats>,
    /// Whether any response has been applied for this type since the watch
    /// was added. Gates the init-fetch timeout.
    pub(crate) received_update: bool,
}

impl std::fmt::Debug for WatchEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchEntry")
            .field("resource_names", &self.resource_names)
            .field("received_update", &self.received_update)
            .finish_non_exhaustive()
    }
}

/// The live watches of one type plus their cached interest union.
#[derive(Debug)]
pub(crate) struct WatchMap {
    watches: HashMap<WatchId, WatchEntry>,
    interest: InterestSet,
}

impl Default for WatchMap {
    fn default() -> Self {
        Self {
            watches: HashMap::new(),
            interest: InterestSet::Named(BTreeSet::new()),
        }
    }
}

impl WatchMap {
    /// Insert a watch and recompute the union.
    /// Returns true if the merged interest changed.
    pub(crate) fn insert(&mut self, id: WatchId, entry: WatchEntry) -> bool {
        self.watches.insert(id, entry);
        self.recompute()
    }

    /// Remove a watch and recompute the union.
    /// Returns the removed entry, if any, and whether the interest changed.
    pub(crate) fn remove(&mut self, id: WatchId) -> (Option<WatchEntry>, bool) {
        let entry = self.watches.remove(&id);
        let changed = self.recompute();
        (entry, changed)
    }

    /// Replace one watch's name contribution and recompute the union.
    /// Returns true if the merged interest changed.
    pub(crate) fn update_names(&mut self, id: WatchId, resource_names: BTreeSet<String>) -> bool {
        match self.watches.get_mut(&id) {
            Some(entry) => {
                entry.resource_names = resource_names;
                self.recompute()
            }
            None => false,
        }
    }

    /// Recompute the union from the live watches.
    /// Returns true if the merged interest changed.
    fn recompute(&mut self) -> bool {
        let has_wildcard = !self.watches.is_empty()
            && self.watches.values().any(|e| e.resource_names.is_empty());

        let interest = if has_wildcard {
            InterestSet::Wildcard
        } else {
            InterestSet::Named(
                self.watches
                    .values()
                    .flat_map(|e| e.resource_names.iter().cloned())
                    .collect(),
            )
        };

        let changed = interest != self.interest;
        self.interest = interest;
        changed
    }

    pub(crate) fn interest(&self) -> &InterestSet {
        &self.interest
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    pub(crate) fn get_mut(&mut self, id: WatchId) -> Option<&mut WatchEntry> {
        self.watches.get_mut(&id)
    }

    pub(crate) fn ids(&self) -> Vec<WatchId> {
        self.watches.keys().copied().collect()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (&WatchId, &mut WatchEntry)> {
        self.watches.iter_mut()
    }

    /// Resource names to carry in an outbound request for this type.
    pub(crate) fn resource_names_for_request(&self) -> Vec<String> {
        self.interest.resource_names_for_request()
    }
}

/// Lifecycle of a type's subscription on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TypePhase {
    /// No interest declared yet (or all watches removed).
    Uninitialized,
    /// Request sent, awaiting the first response on this stream.
    Subscribing,
    /// Receiving and applying updates.
    Active,
}
