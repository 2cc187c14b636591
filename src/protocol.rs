//! Locator message definitions.
//!
//! Two families of messages live here:
//!
//! - [`Datagram`]: the query/reply messages broadcast over multicast UDP. They
//!   are JSON encoded, one message per datagram.
//! - [`LocatorProtocol`]: the RPC requests carried over iroh with the irpc
//!   framework, used for liveness probes and for talking to a resolved
//!   directory service.

use std::net::SocketAddr;

use anyhow::{bail, Result};
use irpc::channel::oneshot;
use irpc::rpc_requests;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{DirectoryReference, Endpoints, Identity, QueryKey, RequestId, RpcError};

/// Upper bound on an encoded datagram.
pub const MAX_DATAGRAM_SIZE: usize = 8 * 1024;

// ============================================================================
// Multicast Datagrams
// ============================================================================

/// A query broadcast to every responder on the multicast group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryMessage {
    /// Responders ignore queries from other domains.
    pub domain_id: String,
    /// Identifies the broadcast round this query belongs to.
    pub request_id: RequestId,
    /// What is being looked up.
    pub key: QueryKey,
    /// Unicast address replies should be sent to.
    pub reply_to: SocketAddr,
}

/// The answer carried by a reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ReplyPayload {
    /// Location of an entity.
    Entity { endpoints: Endpoints },
    /// Location of an adapter, or of one member of a replica group.
    Adapter {
        endpoints: Endpoints,
        is_replica_group: bool,
    },
    /// Location of a directory service.
    Directory { reference: DirectoryReference },
}

/// A reply sent by a responder directly to the querier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplyMessage {
    /// Generated once per reply. Copies of one reply duplicated on the way
    /// carry the same id and are dropped by the querier.
    pub reply_id: Uuid,
    /// Round of the query being answered.
    pub request_id: RequestId,
    /// Key of the query being answered.
    pub key: QueryKey,
    pub payload: ReplyPayload,
}

impl ReplyMessage {
    pub fn new(request_id: RequestId, key: QueryKey, payload: ReplyPayload) -> Self {
        Self {
            reply_id: Uuid::new_v4(),
            request_id,
            key,
            payload,
        }
    }
}

/// Everything that travels over the discovery datagram sockets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Datagram {
    Query(QueryMessage),
    Reply(ReplyMessage),
}

impl Datagram {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            bail!(
                "encoded datagram is {} bytes, limit is {MAX_DATAGRAM_SIZE}",
                bytes.len()
            );
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

// ============================================================================
// Directory RPC
// ============================================================================

/// An operation forwarded to a directory service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DirectoryRequest {
    FindEntity(Identity),
    FindAdapter(String),
    RegisterAdapter { name: String, endpoints: Endpoints },
    UnregisterAdapter(String),
    RegisterReplicaMember { group: String, adapter: String },
    UnregisterReplicaMember { group: String, adapter: String },
    Ping,
}

impl DirectoryRequest {
    /// Operation name used in diagnostics and error reports.
    pub fn operation(&self) -> &'static str {
        match self {
            DirectoryRequest::FindEntity(_) => "findEntity",
            DirectoryRequest::FindAdapter(_) => "findAdapter",
            DirectoryRequest::RegisterAdapter { .. } => "registerAdapter",
            DirectoryRequest::UnregisterAdapter(_) => "unregisterAdapter",
            DirectoryRequest::RegisterReplicaMember { .. } => "registerReplicaMember",
            DirectoryRequest::UnregisterReplicaMember { .. } => "unregisterReplicaMember",
            DirectoryRequest::Ping => "ping",
        }
    }
}

/// Result of a [`DirectoryRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DirectoryResponse {
    Entity(Option<Endpoints>),
    Adapter(Option<(Endpoints, bool)>),
    Ack,
}

/// Liveness probe for an object hosted behind some endpoints.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingRequest {
    pub identity: Identity,
}

/// A request forwarded to a directory service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirectoryCall {
    pub request: DirectoryRequest,
}

/// The locator RPC protocol definition using irpc's RPC framework.
#[rpc_requests(message = LocatorMessage)]
#[derive(Debug, Serialize, Deserialize)]
pub enum LocatorProtocol {
    /// Check whether the remote node hosts the identity.
    #[rpc(tx = oneshot::Sender<bool>)]
    Ping(PingRequest),
    /// Run a directory operation on the remote registry.
    #[rpc(tx = oneshot::Sender<Result<DirectoryResponse, RpcError>>)]
    Directory(DirectoryCall),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_survives_encoding() {
        let query = Datagram::Query(QueryMessage {
            domain_id: "lab".into(),
            request_id: RequestId::generate(),
            key: QueryKey::Adapter("A1".into()),
            reply_to: "10.0.0.5:4062".parse().expect("socket addr"),
        });
        let bytes = query.encode().expect("encode");
        assert_eq!(Datagram::decode(&bytes).expect("decode"), query);
    }

    #[test]
    fn oversized_datagrams_are_rejected() {
        let endpoints: Endpoints = (0..1000)
            .map(|i| format!("tcp://10.0.{}.{}:4000", i / 256, i % 256))
            .collect();
        let reply = Datagram::Reply(ReplyMessage::new(
            RequestId::generate(),
            QueryKey::Adapter("big".into()),
            ReplyPayload::Adapter {
                endpoints,
                is_replica_group: false,
            },
        ));
        assert!(reply.encode().is_err());
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(Datagram::decode(b"\x00\x01not json").is_err());
    }
}
