//! `tonic` based transport implementation.
//!
//! This transport uses tonic's low-level `Grpc` client with a `BytesCodec`
//! to send and receive raw bytes, allowing the mux layer to handle
//! serialization/deserialization independently.

use crate::error::{Error, Result};
use crate::transport::{Transport, TransportStream};
use bytes::{Buf, BufMut, Bytes};
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::transport::Channel;
use tonic::{Status, Streaming};

/// The gRPC path for the ADS StreamAggregatedResources RPC.
const ADS_PATH: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";

/// The gRPC path for the ADS DeltaAggregatedResources RPC.
const DELTA_ADS_PATH: &str =
    "/envoy.service.discovery.v3.AggregatedDiscoveryService/DeltaAggregatedResources";

const ADS_CHANNEL_BUFFER_SIZE: usize = 16;

/// A codec that passes bytes through without serialization.
///
/// This allows us to handle serialization in the mux layer rather than in
/// the transport layer.
#[derive(Debug, Clone, Copy)]
struct BytesCodec;

impl Codec for BytesCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = BytesEncoder;
    type Decoder = BytesDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        BytesEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        BytesDecoder
    }
}

#[derive(Debug)]
struct BytesEncoder;

impl Encoder for BytesEncoder {
    type Item = Bytes;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

#[derive(Debug)]
struct BytesDecoder;

impl Decoder for BytesDecoder {
    type Item = Bytes;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        Ok(Some(src.copy_to_bytes(src.remaining())))
    }
}

/// Factory for creating discovery streams using tonic.
#[derive(Clone, Debug)]
pub struct TonicTransport {
    channel: Channel,
}

impl TonicTransport {
    /// Create a transport from an existing tonic [`Channel`].
    ///
    /// Use this when you need custom channel configuration (e.g., TLS,
    /// timeouts).
    pub fn from_channel(channel: Channel) -> Self {
        Self { channel }
    }

    /// Connect to a management server with default settings.
    ///
    /// For custom configuration (TLS, timeouts, etc.), use
    /// [`from_channel`](Self::from_channel).
    pub async fn connect(uri: impl Into<String>) -> Result<Self> {
        let uri: String = uri.into();
        let channel = Channel::from_shared(uri)
            .map_err(|e| Error::Connection(e.to_string()))?
            .connect()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self { channel })
    }

    async fn open(&self, path: &'static str, initial_requests: Vec<Bytes>) -> Result<TonicAdsStream> {
        use tokio_stream::StreamExt as _;

        let mut grpc = Grpc::new(self.channel.clone());

        grpc.ready()
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Bytes>(ADS_CHANNEL_BUFFER_SIZE);

        // The stream first yields the initial requests, then reads from the
        // channel, so data is available the moment the stream is polled.
        // Servers that withhold response headers until the first request
        // message would otherwise deadlock.
        let initial_stream = tokio_stream::iter(initial_requests);
        let channel_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let request_stream = initial_stream.chain(channel_stream);

        let path = PathAndQuery::from_static(path);

        let response = grpc
            .streaming(tonic::Request::new(request_stream), path, BytesCodec)
            .await
            .map_err(Error::Stream)?;

        Ok(TonicAdsStream {
            sender: tx,
            receiver: response.into_inner(),
        })
    }
}

impl Transport for TonicTransport {
    type Stream = TonicAdsStream;

    async fn new_stream(&self, initial_requests: Vec<Bytes>) -> Result<Self::Stream> {
        self.open(ADS_PATH, initial_requests).await
    }

    async fn new_delta_stream(&self, initial_requests: Vec<Bytes>) -> Result<Self::Stream> {
        self.open(DELTA_ADS_PATH, initial_requests).await
    }
}

/// A bidirectional discovery stream backed by tonic.
#[derive(Debug)]
pub struct TonicAdsStream {
    sender: mpsc::Sender<Bytes>,
    receiver: Streaming<Bytes>,
}

impl TransportStream for TonicAdsStream {
    async fn send(&mut self, request: Bytes) -> Result<()> {
        self.sender
            .send(request)
            .await
            .map_err(|_| Error::StreamClosed)?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>> {
        match self.receiver.message().await {
            Ok(msg) => Ok(msg),
            Err(status) => Err(Error::Stream(status)),
        }
    }
}
