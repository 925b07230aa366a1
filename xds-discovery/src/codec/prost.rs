//! Prost-based codec using envoy-types.

use crate::codec::DiscoveryCodec;
use crate::error::{Error, Result};
use crate::message::{
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DeltaResource, DiscoveryRequest,
    DiscoveryResponse, Node, ResourceAny,
};
use bytes::Bytes;
use prost::Message;

/// A codec that uses prost/envoy-types for serialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProstCodec;

fn encode_node(node: &Node) -> envoy_types::pb::envoy::config::core::v3::Node {
    use envoy_types::pb::envoy::config::core::v3 as core;

    core::Node {
        id: node.id.clone().unwrap_or_default(),
        cluster: node.cluster.clone().unwrap_or_default(),
        user_agent_name: node.user_agent_name.clone(),
        user_agent_version_type: Some(core::node::UserAgentVersionType::UserAgentVersion(
            node.user_agent_version.clone(),
        )),
        locality: node.locality.as_ref().map(|l| core::Locality {
            region: l.region.clone(),
            zone: l.zone.clone(),
            sub_zone: l.sub_zone.clone(),
        }),
        ..Default::default()
    }
}

impl DiscoveryCodec for ProstCodec {
    fn encode_request(&self, request: &DiscoveryRequest<'_>) -> Result<Bytes> {
        use envoy_types::pb::envoy::service::discovery::v3 as discovery;
        use envoy_types::pb::google::rpc::Status;

        let proto_request = discovery::DiscoveryRequest {
            version_info: request.version_info.to_owned(),
            node: Some(encode_node(request.node)),
            resource_names: request.resource_names.to_vec(),
            type_url: request.type_url.to_owned(),
            response_nonce: request.response_nonce.to_owned(),
            error_detail: request.error_detail.as_ref().map(|e| Status {
                code: e.code,
                message: e.message.clone(),
                details: vec![],
            }),
            ..Default::default()
        };

        Ok(proto_request.encode_to_vec().into())
    }

    fn decode_response(&self, bytes: Bytes) -> Result<DiscoveryResponse> {
        use envoy_types::pb::envoy::service::discovery::v3 as discovery;

        let proto_response = discovery::DiscoveryResponse::decode(bytes).map_err(Error::Decode)?;

        Ok(DiscoveryResponse {
            version_info: proto_response.version_info,
            resources: proto_response
                .resources
                .into_iter()
                .map(|any| ResourceAny {
                    type_url: any.type_url,
                    value: any.value.into(),
                })
                .collect(),
            type_url: proto_response.type_url,
            nonce: proto_response.nonce,
        })
    }

    fn encode_delta_request(&self, request: &DeltaDiscoveryRequest<'_>) -> Result<Bytes> {
        use envoy_types::pb::envoy::service::discovery::v3 as discovery;
        use envoy_types::pb::google::rpc::Status;

        let proto_request = discovery::DeltaDiscoveryRequest {
            node: request.node.map(encode_node),
            type_url: request.type_url.to_owned(),
            resource_names_subscribe: request.resource_names_subscribe.clone(),
            resource_names_unsubscribe: request.resource_names_unsubscribe.clone(),
            initial_resource_versions: request.initial_resource_versions.iter().cloned().collect(),
            response_nonce: request.response_nonce.to_owned(),
            error_detail: request.error_detail.as_ref().map(|e| Status {
                code: e.code,
                message: e.message.clone(),
                details: vec![],
            }),
            ..Default::default()
        };

        Ok(proto_request.encode_to_vec().into())
    }

    fn decode_delta_response(&self, bytes: Bytes) -> Result<DeltaDiscoveryResponse> {
        use envoy_types::pb::envoy::service::discovery::v3 as discovery;

        let proto_response =
            discovery::DeltaDiscoveryResponse::decode(bytes).map_err(Error::Decode)?;

        Ok(DeltaDiscoveryResponse {
            system_version_info: proto_response.system_version_info,
            resources: proto_response
                .resources
                .into_iter()
                .map(|r| DeltaResource {
                    name: r.name,
                    version: r.version,
                    resource: r
                        .resource
                        .map(|any| ResourceAny {
                            type_url: any.type_url,
                            value: any.value.into(),
                        })
                        .unwrap_or(ResourceAny {
                            type_url: proto_response.type_url.clone(),
                            value: Bytes::new(),
                        }),
                })
                .collect(),
            removed_resources: proto_response.removed_resources,
            type_url: proto_response.type_url,
            nonce: proto_response.nonce,
        })
    }
}
