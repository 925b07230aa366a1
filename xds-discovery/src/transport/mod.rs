//! Provides abstraction for transport layers.

use crate::error::Result;
use bytes::Bytes;
use std::future::Future;

#[cfg(feature = "transport-tonic")]
pub mod tonic;

/// Factory for creating discovery streams.
///
/// This abstraction allows for different transport implementations:
/// - Tonic-based gRPC transport
/// - Mock transport for testing
/// - Other custom transports
pub trait Transport: Send + Sync + 'static {
    /// The stream type produced by this transport.
    type Stream: TransportStream;

    /// Creates a new bidirectional state-of-the-world discovery stream.
    ///
    /// `initial_requests` are flushed before anything else so that servers
    /// which withhold response headers until the first message see data
    /// immediately. This may be called multiple times for reconnection.
    fn new_stream(
        &self,
        initial_requests: Vec<Bytes>,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Creates a new bidirectional incremental (delta) discovery stream.
    ///
    /// Same contract as [`new_stream`](Transport::new_stream), on the delta
    /// RPC of the aggregated discovery service.
    fn new_delta_stream(
        &self,
        initial_requests: Vec<Bytes>,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;
}

/// A bidirectional byte stream for discovery communication.
///
/// Raw byte transport where the bytes are serialized requests/responses;
/// (de)serialization is handled at the mux layer.
pub trait TransportStream: Send + 'static {
    /// Send serialized request bytes to the server.
    fn send(&mut self, request: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Receive serialized response bytes from the server.
    ///
    /// Returns:
    /// - `Ok(Some(bytes))` - Received a response.
    /// - `Ok(None)` - Stream closed normally.
    /// - `Err(_)` - Stream error (connection dropped, etc.)
    fn recv(&mut self) -> impl Future<Output = Result<Option<Bytes>>> + Send;
}
