//! Resolution of the directory service itself.
//!
//! Unlike adapter lookups there is a single target, but any number of calls
//! may need it at once. Calls made while no reference is known are queued on
//! the resolver and a single resolution runs for all of them:
//!
//! - on success every queued call is dispatched against the new reference;
//! - on failure every queued call is dispatched against the void reference,
//!   which answers "not found", and a back-off window opens during which new
//!   calls go straight to the void reference without touching the network.
//!
//! A call that finds its reference stale (the object is gone or unreachable)
//! invalidates it and goes through resolution once more. Structural errors
//! are returned to the caller unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::channel::QueryChannel;
use crate::config::DirectoryConfig;
use crate::core::{DirectoryReference, DiscoveryError, Endpoints, Identity, QueryKey, RpcError};
use crate::locator::Locator;
use crate::protocol::{DirectoryRequest, DirectoryResponse};
use crate::query::QueryParams;

/// Number of times a single call may re-resolve after hitting a stale reference.
const STALE_RETRIES: u32 = 1;

/// Transport for calls to a resolved directory service.
#[async_trait]
pub trait DirectoryRpc: Send + Sync + 'static {
    async fn call(
        &self,
        target: &DirectoryReference,
        request: DirectoryRequest,
    ) -> Result<DirectoryResponse, RpcError>;
}

/// Where a call is dispatched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DirectoryTarget {
    Live(DirectoryReference),
    /// Stand-in used once resolution failed: every call reports not found.
    Void,
}

struct QueuedCall {
    request: DirectoryRequest,
    reply: oneshot::Sender<Result<DirectoryResponse, DiscoveryError>>,
    stale_retries_left: u32,
}

#[derive(Default)]
struct ResolverState {
    current: Option<DirectoryReference>,
    resolving: bool,
    pending_requests: Vec<QueuedCall>,
    /// New resolutions are suppressed until this instant.
    next_retry: Option<Instant>,
    shut_down: bool,
}

struct ResolverInner<C: QueryChannel, R: DirectoryRpc> {
    locator: Locator<C>,
    rpc: R,
    config: DirectoryConfig,
    state: Mutex<ResolverState>,
}

/// Directory resolver shared by every caller that needs the directory service.
pub struct DirectoryResolver<C: QueryChannel, R: DirectoryRpc> {
    inner: Arc<ResolverInner<C, R>>,
}

impl<C: QueryChannel, R: DirectoryRpc> Clone for DirectoryResolver<C, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: QueryChannel, R: DirectoryRpc> DirectoryResolver<C, R> {
    pub fn new(locator: Locator<C>, rpc: R, config: DirectoryConfig) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                locator,
                rpc,
                config,
                state: Mutex::new(ResolverState::default()),
            }),
        }
    }

    /// Run `request` against the directory service, resolving it first if
    /// needed. Only "not found" style failures and structural remote errors
    /// reach the caller.
    pub async fn invoke(
        &self,
        request: DirectoryRequest,
    ) -> Result<DirectoryResponse, DiscoveryError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .clone()
            .submit(QueuedCall {
                request,
                reply: tx,
                stale_retries_left: STALE_RETRIES,
            })
            .await;
        rx.await.unwrap_or(Err(DiscoveryError::Shutdown))
    }

    pub async fn find_adapter(&self, name: &str) -> Result<(Endpoints, bool), DiscoveryError> {
        let key = QueryKey::Adapter(name.to_string());
        match self
            .invoke(DirectoryRequest::FindAdapter(name.to_string()))
            .await?
        {
            DirectoryResponse::Adapter(Some(found)) => Ok(found),
            _ => Err(DiscoveryError::NotFound(key)),
        }
    }

    pub async fn find_entity(&self, identity: &Identity) -> Result<Endpoints, DiscoveryError> {
        let key = QueryKey::Entity(identity.clone());
        match self
            .invoke(DirectoryRequest::FindEntity(identity.clone()))
            .await?
        {
            DirectoryResponse::Entity(Some(endpoints)) => Ok(endpoints),
            _ => Err(DiscoveryError::NotFound(key)),
        }
    }

    /// The reference calls are currently dispatched to, if any.
    pub async fn current(&self) -> Option<DirectoryReference> {
        self.inner.state.lock().await.current.clone()
    }

    /// Fail every queued call with [`DiscoveryError::Shutdown`]. Later calls,
    /// and calls that would re-resolve, fail the same way.
    pub async fn shutdown(&self) {
        let queued = {
            let mut state = self.inner.state.lock().await;
            state.shut_down = true;
            state.current = None;
            std::mem::take(&mut state.pending_requests)
        };
        for call in queued {
            let _ = call.reply.send(Err(DiscoveryError::Shutdown));
        }
    }
}

impl<C: QueryChannel, R: DirectoryRpc> ResolverInner<C, R> {
    fn key(&self) -> QueryKey {
        QueryKey::Directory(self.config.instance_name.clone().unwrap_or_default())
    }

    async fn submit(self: Arc<Self>, call: QueuedCall) {
        let mut state = self.state.lock().await;
        if state.shut_down {
            let _ = call.reply.send(Err(DiscoveryError::Shutdown));
            return;
        }
        if let Some(reference) = state.current.clone() {
            drop(state);
            self.spawn_dispatch(DirectoryTarget::Live(reference), call);
            return;
        }
        if state.next_retry.is_some_and(|at| Instant::now() < at) {
            drop(state);
            self.spawn_dispatch(DirectoryTarget::Void, call);
            return;
        }

        state.pending_requests.push(call);
        if !state.resolving {
            state.resolving = true;
            drop(state);
            tokio::spawn(self.clone().resolve());
        }
    }

    async fn resolve(self: Arc<Self>) {
        let instance_name = self.config.instance_name.clone().unwrap_or_default();
        let params = QueryParams {
            timeout: self.config.timeout,
            retry_count: self.config.retry_count,
            latency_multiplier: self.locator.config().latency_multiplier,
        };
        let outcome = self.locator.locate_directory(&instance_name, params).await;

        let (target, queued) = {
            let mut state = self.state.lock().await;
            state.resolving = false;
            let queued = std::mem::take(&mut state.pending_requests);
            if state.shut_down {
                debug!("directory resolver shut down during resolution");
                for call in queued {
                    let _ = call.reply.send(Err(DiscoveryError::Shutdown));
                }
                return;
            }
            match outcome {
                Ok(reference) => {
                    info!(
                        instance = %reference.instance_name,
                        endpoints = %reference.endpoints,
                        "resolved directory service"
                    );
                    state.current = Some(reference.clone());
                    state.next_retry = None;
                    (DirectoryTarget::Live(reference), queued)
                }
                Err(err) => {
                    warn!(queued = queued.len(), "directory resolution failed: {err}");
                    state.next_retry = Some(Instant::now() + self.config.retry_delay);
                    (DirectoryTarget::Void, queued)
                }
            }
        };

        for call in queued {
            self.spawn_dispatch(target.clone(), call);
        }
    }

    fn spawn_dispatch(self: &Arc<Self>, target: DirectoryTarget, call: QueuedCall) {
        let this = self.clone();
        tokio::spawn(async move { this.dispatch(target, call).await });
    }

    async fn dispatch(self: Arc<Self>, target: DirectoryTarget, mut call: QueuedCall) {
        let reference = match target {
            DirectoryTarget::Live(reference) => reference,
            DirectoryTarget::Void => {
                let _ = call.reply.send(Err(DiscoveryError::NotFound(self.key())));
                return;
            }
        };

        match self.rpc.call(&reference, call.request.clone()).await {
            Ok(response) => {
                let _ = call.reply.send(Ok(response));
            }
            Err(err) if err.is_stale() => {
                self.invalidate(&reference).await;
                if call.stale_retries_left == 0 {
                    let _ = call.reply.send(Err(DiscoveryError::NotFound(self.key())));
                    return;
                }
                call.stale_retries_left -= 1;
                debug!(
                    operation = call.request.operation(),
                    "directory reference is stale ({err}); re-resolving"
                );
                self.submit(call).await;
            }
            Err(err) => {
                let _ = call.reply.send(Err(DiscoveryError::Remote(err)));
            }
        }
    }

    /// Forget `reference` unless a newer one replaced it meanwhile.
    async fn invalidate(&self, reference: &DirectoryReference) {
        let mut state = self.state.lock().await;
        if state.current.as_ref() == Some(reference) {
            state.current = None;
        }
    }
}
