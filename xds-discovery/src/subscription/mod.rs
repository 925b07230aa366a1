//! The uniform subscription contract over every delivery mechanism.
//!
//! A [`Subscription`] is a handle over one concrete delivery mechanism —
//! aggregated stream, delta stream, polled fetch, or static in-memory
//! source. All of them synthesize the same [`SubscriptionCallbacks`] calls,
//! so consumers stay agnostic to how their configuration arrives.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::message::{DeltaResource, ResourceAny};

pub mod factory;
pub mod grpc;
pub mod inline;
pub mod polled;

pub use factory::{ConfigSource, SubscriptionFactory};
pub use grpc::GrpcSubscription;
pub use inline::InlineSubscription;
pub use polled::{ConfigFetcher, FetchedSnapshot, PolledSubscription};

#[cfg(feature = "rt-tokio")]
pub use polled::FileFetcher;

/// Why a configuration update attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigUpdateFailureReason {
    /// The stream to the management server could not be established or was
    /// lost. Previously applied configuration stays in effect.
    ConnectionFailure,
    /// No response arrived within the init-fetch timeout of first
    /// subscribing. Non-fatal; a later response still applies normally.
    FetchTimedOut,
    /// The consumer rejected the update's content; it was NACKed and the
    /// last accepted configuration stays in effect.
    UpdateRejected,
}

/// A rejected configuration update, carried on the NACK as error detail.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigUpdateError {
    /// Human-readable description of the rejected resource(s).
    pub message: String,
}

impl ConfigUpdateError {
    /// Create a new update rejection with the given detail message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Invoked when resources of a watched type change or when an update
/// attempt fails.
///
/// Callbacks run on the delivery mechanism's owning task; they must not
/// block. Returning `Err` from an update callback rejects the update: the
/// delivery mechanism NACKs it (where the protocol has a NACK) and the
/// previously accepted version stays in effect.
pub trait SubscriptionCallbacks: Send + 'static {
    /// A state-of-the-world update: `resources` is the complete current set
    /// for the type; anything previously delivered but absent is implicitly
    /// gone.
    fn on_config_update(
        &mut self,
        resources: &[ResourceAny],
        version_info: &str,
    ) -> Result<(), ConfigUpdateError>;

    /// An incremental update: only changed resources and explicit removals.
    ///
    /// The default implementation rejects, for consumers wired to
    /// state-of-the-world delivery only.
    fn on_delta_config_update(
        &mut self,
        added_resources: &[DeltaResource],
        removed_resources: &[String],
        system_version_info: &str,
    ) -> Result<(), ConfigUpdateError> {
        let _ = (added_resources, removed_resources, system_version_info);
        Err(ConfigUpdateError::new(
            "incremental updates not supported by this subscription",
        ))
    }

    /// An update attempt failed; see [`ConfigUpdateFailureReason`].
    /// `error` is present only for [`ConfigUpdateFailureReason::UpdateRejected`].
    fn on_config_update_failed(
        &mut self,
        reason: ConfigUpdateFailureReason,
        error: Option<&ConfigUpdateError>,
    );
}

/// A uniform handle over one concrete configuration delivery mechanism.
pub trait Subscription: Send {
    /// Begin delivery for the given initial resource names.
    ///
    /// An empty set is a wildcard subscription where the mechanism supports
    /// one. Calling `start` more than once is a no-op.
    fn start(&mut self, initial_resource_names: BTreeSet<String>);

    /// Replace the set of resource names this subscription is interested in.
    fn update_resource_interest(&mut self, resource_names: BTreeSet<String>);
}
