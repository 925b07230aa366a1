//! Crate-owned discovery message types.
//!
//! These types are codegen-agnostic and serve as the interface between
//! the mux logic and the codec layer. The codec converts them to/from
//! the wire format (e.g., prost/envoy-types).
//!
//! # Nonce contract
//!
//! The mux generates a fresh opaque nonce for every outbound request and
//! carries it in [`DiscoveryRequest::response_nonce`] (likewise for the
//! delta variant). The management server echoes the most recently received
//! request nonce in [`DiscoveryResponse::nonce`]; a response whose nonce
//! does not match the latest request nonce for its type is stale and is
//! dropped without being applied.

use bytes::Bytes;

/// A discovery request to send to the management server.
///
/// Sent both to (re)declare resource interest and to acknowledge or reject
/// a previously received response. A request with `error_detail` set is a
/// NACK; it retains the last accepted `version_info`.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest<'a> {
    /// The version_info from the most recent successfully applied
    /// response for this type, or empty before the first accept.
    pub version_info: &'a str,
    /// The node making the request.
    pub node: &'a Node,
    /// List of resource names of interest. Empty means a wildcard
    /// subscription to every resource of the type.
    pub resource_names: &'a [String],
    /// Type URL of the resource being requested.
    pub type_url: &'a str,
    /// Fresh per-request nonce; see the module docs for the contract.
    pub response_nonce: &'a str,
    /// Error details if this request is a NACK.
    pub error_detail: Option<ErrorDetail>,
}

/// A state-of-the-world discovery response from the management server.
///
/// Carries the complete current resource set for its type; any previously
/// delivered resource absent from `resources` is implicitly removed.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResponse {
    /// The version of the response data.
    pub version_info: String,
    /// The response resources wrapped as opaque payloads.
    pub resources: Vec<ResourceAny>,
    /// Type URL of the resources.
    pub type_url: String,
    /// Echo of the most recent request nonce for this type.
    pub nonce: String,
}

/// An incremental discovery request.
///
/// Interest changes are expressed as diffs against the previously declared
/// set; ACK/NACK semantics follow [`DiscoveryRequest`].
#[derive(Debug, Clone, Default)]
pub struct DeltaDiscoveryRequest<'a> {
    /// The node making the request. Only set on the first request of a stream.
    pub node: Option<&'a Node>,
    /// Type URL of the resource being requested.
    pub type_url: &'a str,
    /// Resource names newly subscribed since the previous request.
    pub resource_names_subscribe: Vec<String>,
    /// Resource names no longer of interest.
    pub resource_names_unsubscribe: Vec<String>,
    /// Versions of resources already held, sent on stream (re)establishment
    /// so the server can skip re-sending unchanged resources.
    pub initial_resource_versions: Vec<(String, String)>,
    /// Fresh per-request nonce; see the module docs for the contract.
    pub response_nonce: &'a str,
    /// Error details if this request is a NACK.
    pub error_detail: Option<ErrorDetail>,
}

/// An incremental discovery response.
#[derive(Debug, Clone, Default)]
pub struct DeltaDiscoveryResponse {
    /// System version of the response; informational for delta streams.
    pub system_version_info: String,
    /// Resources added or changed since the last response.
    pub resources: Vec<DeltaResource>,
    /// Names of resources removed since the last response.
    pub removed_resources: Vec<String>,
    /// Type URL of the resources.
    pub type_url: String,
    /// Echo of the most recent request nonce for this type.
    pub nonce: String,
}

/// A resource wrapped as an opaque typed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceAny {
    /// Type URL of the resource.
    pub type_url: String,
    /// Serialized resource bytes.
    pub value: Bytes,
}

/// A named, versioned resource carried by a delta response.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaResource {
    /// The resource name.
    pub name: String,
    /// Per-resource version assigned by the server.
    pub version: String,
    /// The resource payload.
    pub resource: ResourceAny,
}

/// Node identification for the client.
#[derive(Debug, Clone)]
pub struct Node {
    /// An opaque node identifier.
    pub id: Option<String>,
    /// The cluster the node belongs to.
    pub cluster: Option<String>,
    /// Locality specifying where the node is running.
    pub locality: Option<Locality>,
    /// Free-form string identifying the client type (e.g., "envoy", "grpc").
    pub user_agent_name: String,
    /// Version of the client.
    pub user_agent_version: String,
}

impl Node {
    /// Create a new Node with the required user agent fields.
    ///
    /// Other fields (id, cluster, locality) can be set using builder methods.
    pub fn new(user_agent_name: impl Into<String>, user_agent_version: impl Into<String>) -> Self {
        Self {
            id: None,
            cluster: None,
            locality: None,
            user_agent_name: user_agent_name.into(),
            user_agent_version: user_agent_version.into(),
        }
    }

    /// Set the node ID.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set the cluster.
    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    /// Set the locality.
    pub fn with_locality(mut self, locality: Locality) -> Self {
        self.locality = Some(locality);
        self
    }
}

/// Locality information identifying where a node is running.
#[derive(Debug, Clone, Default)]
pub struct Locality {
    /// Region the node is in.
    pub region: String,
    /// Zone within the region.
    pub zone: String,
    /// Sub-zone within the zone.
    pub sub_zone: String,
}

/// Error details for NACK requests.
#[derive(Debug, Clone)]
pub struct ErrorDetail {
    /// gRPC status code.
    pub code: i32,
    /// Error message.
    pub message: String,
}
