//! Codec for encoding/decoding discovery messages.
//!
//! The codec layer converts between crate-owned message types
//! ([`DiscoveryRequest`], [`DiscoveryResponse`] and their delta variants)
//! and serialized bytes. This abstraction allows different protobuf
//! implementations to be used with the same mux logic.

use crate::error::Result;
use crate::message::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use bytes::Bytes;

#[cfg(feature = "codegen-prost")]
pub mod prost;

/// Trait for encoding/decoding discovery messages.
///
/// Implementations convert between the crate-owned message types
/// and their serialized wire format.
pub trait DiscoveryCodec: Send + Sync + 'static {
    /// Encode a [`DiscoveryRequest`] to bytes.
    fn encode_request(&self, request: &DiscoveryRequest<'_>) -> Result<Bytes>;

    /// Decode bytes into a [`DiscoveryResponse`].
    fn decode_response(&self, bytes: Bytes) -> Result<DiscoveryResponse>;

    /// Encode a [`DeltaDiscoveryRequest`] to bytes.
    fn encode_delta_request(&self, request: &DeltaDiscoveryRequest<'_>) -> Result<Bytes>;

    /// Decode bytes into a [`DeltaDiscoveryResponse`].
    fn decode_delta_response(&self, bytes: Bytes) -> Result<DeltaDiscoveryResponse>;
}
