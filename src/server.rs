//! Server side of the locator: answering multicast queries and RPCs.
//!
//! - [`Responder`] receives queries on the multicast group and answers them
//!   from its [`Registry`], replying unicast to the querier.
//! - [`RpcService`] is the irpc actor behind [`crate::net::serve_rpc`]; it
//!   answers liveness probes for hosted identities and runs directory
//!   operations against the same registry.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use irpc::WithChannels;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use crate::channel::MulticastListener;
use crate::config::ResponderConfig;
use crate::core::{DirectoryReference, Identity, QueryKey, RpcError};
use crate::protocol::{
    Datagram, DirectoryRequest, DirectoryResponse, LocatorMessage, QueryMessage, ReplyMessage,
    ReplyPayload,
};
use crate::registry::{EntityProbe, Registry};

/// Capacity of the RPC actor's inbox.
const RPC_INBOX: usize = 128;

/// Answers discovery queries from a local registry.
pub struct Responder<P: EntityProbe> {
    config: ResponderConfig,
    registry: Arc<Registry>,
    probe: P,
}

impl<P: EntityProbe> Responder<P> {
    pub fn new(config: ResponderConfig, registry: Arc<Registry>, probe: P) -> Self {
        Self {
            config,
            registry,
            probe,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &ResponderConfig {
        &self.config
    }

    /// Build the reply to `query`, or `None` when this node has nothing to say.
    pub async fn handle_query(&self, query: &QueryMessage) -> Option<ReplyMessage> {
        if query.domain_id != self.config.domain_id {
            trace!(domain = %query.domain_id, "ignoring query from another domain");
            return None;
        }

        let payload = match &query.key {
            QueryKey::Entity(identity) => {
                let endpoints = self.registry.lookup_entity(identity, &self.probe).await?;
                ReplyPayload::Entity { endpoints }
            }
            QueryKey::Adapter(name) => {
                let (endpoints, is_replica_group) = self.registry.lookup_adapter(name).await?;
                ReplyPayload::Adapter {
                    endpoints,
                    is_replica_group,
                }
            }
            QueryKey::Directory(instance_name) => {
                if !instance_name.is_empty() && *instance_name != self.config.instance_name {
                    return None;
                }
                if self.config.directory_endpoints.is_empty() {
                    return None;
                }
                ReplyPayload::Directory {
                    reference: DirectoryReference::new(
                        self.config.instance_name.clone(),
                        self.config.directory_endpoints.clone(),
                    ),
                }
            }
        };

        debug!(key = %query.key, request_id = %query.request_id, "answering query");
        Some(ReplyMessage::new(
            query.request_id,
            query.key.clone(),
            payload,
        ))
    }

    /// Answer queries arriving on `listener` until it fails.
    pub async fn serve(self: Arc<Self>, listener: MulticastListener) -> Result<()> {
        let listener = Arc::new(listener);
        loop {
            let (query, from) = listener.recv_query().await?;
            let this = self.clone();
            let listener = listener.clone();
            tokio::spawn(async move {
                let Some(reply) = this.handle_query(&query).await else {
                    return;
                };
                let to = reply_destination(query.reply_to, from);
                let sent = match Datagram::Reply(reply).encode() {
                    Ok(data) => listener.send_to(&data, to).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = sent {
                    warn!(%to, key = %query.key, "failed to send reply: {err:?}");
                }
            });
        }
    }
}

/// Replies go to the address carried in the query; a querier bound to the
/// wildcard address is reached on the address its query came from.
fn reply_destination(reply_to: SocketAddr, from: SocketAddr) -> SocketAddr {
    if reply_to.ip().is_unspecified() {
        SocketAddr::new(from.ip(), reply_to.port())
    } else {
        reply_to
    }
}

/// RPC actor answering pings and directory operations.
pub struct RpcService<P: EntityProbe> {
    registry: Arc<Registry>,
    probe: P,
    hosted: Mutex<HashSet<Identity>>,
}

impl<P: EntityProbe> RpcService<P> {
    pub fn new(registry: Arc<Registry>, probe: P) -> Self {
        Self {
            registry,
            probe,
            hosted: Mutex::new(HashSet::new()),
        }
    }

    /// Answer liveness probes for `identity` from now on.
    pub async fn host(&self, identity: Identity) {
        self.hosted.lock().await.insert(identity);
    }

    pub async fn handle_ping(&self, identity: &Identity) -> bool {
        self.hosted.lock().await.contains(identity)
    }

    pub async fn handle_directory(
        &self,
        request: DirectoryRequest,
    ) -> Result<DirectoryResponse, RpcError> {
        let response = match request {
            DirectoryRequest::FindEntity(identity) => DirectoryResponse::Entity(
                self.registry.lookup_entity(&identity, &self.probe).await,
            ),
            DirectoryRequest::FindAdapter(name) => {
                DirectoryResponse::Adapter(self.registry.lookup_adapter(&name).await)
            }
            DirectoryRequest::RegisterAdapter { name, endpoints } => {
                if name.is_empty() {
                    return Err(RpcError::Malformed("adapter name is empty".to_string()));
                }
                self.registry.register_adapter(&name, endpoints).await;
                DirectoryResponse::Ack
            }
            DirectoryRequest::UnregisterAdapter(name) => {
                self.registry.unregister_adapter(&name).await;
                DirectoryResponse::Ack
            }
            DirectoryRequest::RegisterReplicaMember { group, adapter } => {
                if group.is_empty() || adapter.is_empty() {
                    return Err(RpcError::Malformed(
                        "replica group and adapter names are required".to_string(),
                    ));
                }
                self.registry.register_replica_member(&group, &adapter).await;
                DirectoryResponse::Ack
            }
            DirectoryRequest::UnregisterReplicaMember { group, adapter } => {
                self.registry
                    .unregister_replica_member(&group, &adapter)
                    .await;
                DirectoryResponse::Ack
            }
            DirectoryRequest::Ping => DirectoryResponse::Ack,
        };
        Ok(response)
    }

    /// Start the actor and return the sender the RPC router feeds.
    pub fn spawn(self: Arc<Self>) -> mpsc::Sender<LocatorMessage> {
        let (tx, rx) = mpsc::channel(RPC_INBOX);
        tokio::spawn(self.run(rx));
        tx
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<LocatorMessage>) {
        while let Some(msg) = rx.recv().await {
            let this = self.clone();
            tokio::spawn(async move { this.handle(msg).await });
        }
    }

    async fn handle(&self, msg: LocatorMessage) {
        match msg {
            LocatorMessage::Ping(msg) => {
                let WithChannels { inner, tx, .. } = msg;
                let hosted = self.handle_ping(&inner.identity).await;
                if let Err(err) = tx.send(hosted).await {
                    debug!("ping reply dropped: {err}");
                }
            }
            LocatorMessage::Directory(msg) => {
                let WithChannels { inner, tx, .. } = msg;
                let operation = inner.request.operation();
                let result = self.handle_directory(inner.request).await;
                if let Err(err) = tx.send(result).await {
                    debug!(operation, "directory reply dropped: {err}");
                }
            }
        }
    }
}
