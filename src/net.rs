//! RPC transport using iroh QUIC endpoints.
//!
//! This module provides [`IrohRpc`], which implements the [`EntityProbe`] and
//! [`DirectoryRpc`] seams over irpc, and [`serve_rpc`] which exposes an
//! [`RpcService`](crate::server::RpcService) to remote callers.
//!
//! # Endpoint descriptors
//!
//! Endpoint sets are opaque to the locator. This transport understands
//! descriptors that are JSON-serialized iroh [`EndpointAddr`]s (see
//! [`endpoint_descriptor`]); any other descriptor in a set is skipped.

use anyhow::Result;
use async_trait::async_trait;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr};
use irpc::Client;
use irpc_iroh::IrohProtocol;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{DirectoryReference, Endpoints, Identity, RpcError};
use crate::directory::DirectoryRpc;
use crate::protocol::{
    DirectoryCall, DirectoryRequest, DirectoryResponse, LocatorMessage, LocatorProtocol,
    PingRequest,
};
use crate::registry::EntityProbe;

/// ALPN protocol identifier for locator RPC connections.
pub const LOCATOR_ALPN: &[u8] = b"iroh-locator/rpc/1";

/// Descriptor under which `addr` appears in an endpoint set.
pub fn endpoint_descriptor(addr: &EndpointAddr) -> Result<String> {
    Ok(serde_json::to_string(addr)?)
}

/// Accept locator RPCs on `endpoint`, handing them to the actor behind `sender`.
pub fn serve_rpc(endpoint: Endpoint, sender: mpsc::Sender<LocatorMessage>) -> Router {
    Router::builder(endpoint)
        .accept(
            LOCATOR_ALPN,
            IrohProtocol::<LocatorProtocol>::with_sender(sender),
        )
        .spawn()
}

/// RPC transport over an iroh [`Endpoint`].
#[derive(Clone)]
pub struct IrohRpc {
    /// The iroh endpoint used for QUIC connections.
    pub endpoint: Endpoint,
}

impl IrohRpc {
    /// Every iroh address found in `endpoints`.
    fn parse_addrs(endpoints: &Endpoints) -> Vec<EndpointAddr> {
        endpoints
            .iter()
            .filter_map(|descriptor| serde_json::from_str(descriptor).ok())
            .collect()
    }

    /// Create an RPC client for one remote address.
    fn client(&self, addr: EndpointAddr) -> Client<LocatorProtocol> {
        irpc_iroh::client::<LocatorProtocol>(self.endpoint.clone(), addr, LOCATOR_ALPN)
    }
}

#[async_trait]
impl EntityProbe for IrohRpc {
    async fn ping(&self, endpoints: &Endpoints, identity: &Identity) -> Result<(), RpcError> {
        let mut last = RpcError::Unreachable(format!("no iroh endpoint in {endpoints}"));
        for addr in Self::parse_addrs(endpoints) {
            let request = PingRequest {
                identity: identity.clone(),
            };
            match self.client(addr).rpc(request).await {
                Ok(true) => return Ok(()),
                Ok(false) => return Err(RpcError::ObjectNotExist),
                Err(err) => {
                    debug!(%identity, "ping failed: {err:?}");
                    last = RpcError::Unreachable(err.to_string());
                }
            }
        }
        Err(last)
    }
}

#[async_trait]
impl DirectoryRpc for IrohRpc {
    async fn call(
        &self,
        target: &DirectoryReference,
        request: DirectoryRequest,
    ) -> Result<DirectoryResponse, RpcError> {
        let mut last = RpcError::Unreachable(format!(
            "no iroh endpoint in {}",
            target.endpoints
        ));
        for addr in Self::parse_addrs(&target.endpoints) {
            let call = DirectoryCall {
                request: request.clone(),
            };
            match self.client(addr).rpc(call).await {
                Ok(result) => return result,
                Err(err) => {
                    debug!(
                        instance = %target.instance_name,
                        operation = request.operation(),
                        "directory call failed: {err:?}"
                    );
                    last = RpcError::Unreachable(err.to_string());
                }
            }
        }
        Err(last)
    }
}
