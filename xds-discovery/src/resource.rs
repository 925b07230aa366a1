//! Typed resource abstraction for consumers.
//!
//! The mux itself treats resource payloads as opaque blobs; consumers that
//! want typed access implement [`Resource`] and decode inside their
//! subscription callbacks, typically via [`decode_all`].

use crate::error::Result;
use crate::message::ResourceAny;
use crate::subscription::ConfigUpdateError;
use bytes::Bytes;

/// Trait for typed discovery resources.
///
/// # Validation
///
/// The `decode` method should:
/// - Parse the raw bytes based on the serialization format, such as Protobuf.
/// - Validate the parsed resource against the expected schema.
///
/// It should return `Err` if parsing fails or validation fails. The error
/// message becomes the NACK's `error_detail` when decoding happens inside a
/// subscription callback.
pub trait Resource: Send + Sync + Clone + std::fmt::Debug + 'static {
    /// The type URL for this resource type.
    ///
    /// Example: `"type.googleapis.com/envoy.config.listener.v3.Listener"`
    const TYPE_URL: &'static str;

    /// Decode and validate a resource from its serialized bytes.
    fn decode(bytes: Bytes) -> Result<Self>;

    /// Returns the resource name.
    ///
    /// The resource name combined with the type URL uniquely identifies a
    /// resource.
    fn name(&self) -> &str;
}

/// Decode a whole update's payloads into `T`.
///
/// Intended for use inside
/// [`SubscriptionCallbacks::on_config_update`](crate::subscription::SubscriptionCallbacks::on_config_update):
/// the first invalid resource fails the batch, and returning that error from
/// the callback NACKs the update with the decode failure as error detail.
pub fn decode_all<T: Resource>(
    resources: &[ResourceAny],
) -> std::result::Result<Vec<T>, ConfigUpdateError> {
    resources
        .iter()
        .map(|resource| {
            T::decode(resource.value.clone()).map_err(|error| {
                ConfigUpdateError::new(format!("{}: {error}", T::TYPE_URL))
            })
        })
        .collect()
}
