#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{sleep, Duration};

use iroh_locator::protocol::QueryMessage;
use iroh_locator::{
    DirectoryReference, DirectoryRequest, DirectoryResponse, DirectoryRpc, EntityProbe, Endpoints,
    Identity, Locator, LocatorConfig, QueryChannel, Registry, Responder, ResponderConfig,
    RpcError, WeakLocator,
};

/// Endpoint set from string literals.
pub fn endpoints(list: &[&str]) -> Endpoints {
    list.iter().copied().collect()
}

pub fn locator_config(timeout_ms: u64, retry_count: u32, latency_multiplier: u32) -> LocatorConfig {
    LocatorConfig {
        domain_id: String::new(),
        timeout: Duration::from_millis(timeout_ms),
        retry_count,
        latency_multiplier,
    }
}

/// Liveness probe that treats every endpoint as alive unless marked dead.
#[derive(Clone, Default)]
pub struct TestProbe {
    dead: Arc<Mutex<HashSet<String>>>,
}

impl TestProbe {
    pub async fn set_dead(&self, endpoint: &str, dead: bool) {
        let mut set = self.dead.lock().await;
        if dead {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }
}

#[async_trait]
impl EntityProbe for TestProbe {
    async fn ping(&self, endpoints: &Endpoints, _identity: &Identity) -> Result<(), RpcError> {
        let dead = self.dead.lock().await;
        if endpoints.iter().any(|e| dead.contains(e)) {
            Err(RpcError::ObjectNotExist)
        } else {
            Ok(())
        }
    }
}

struct BusNode {
    responder: Arc<Responder<TestProbe>>,
    latency: Duration,
}

/// In-memory stand-in for the multicast group.
///
/// Every query sent on a [`TestChannel`] reaches every responder on the bus;
/// each responder answers after its own latency and the reply is handed to
/// the locator registered with [`TestBus::attach`].
#[derive(Default)]
pub struct TestBus {
    nodes: RwLock<Vec<BusNode>>,
    locator: RwLock<Option<WeakLocator<TestChannel>>>,
}

impl TestBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a responder answering from `registry` after `latency`.
    pub async fn add_responder(
        &self,
        config: ResponderConfig,
        registry: Arc<Registry>,
        probe: TestProbe,
        latency: Duration,
    ) {
        let responder = Arc::new(Responder::new(config, registry, probe));
        self.nodes.write().await.push(BusNode { responder, latency });
    }

    /// Shorthand for a default-domain responder with a fresh registry.
    pub async fn add_registry(&self, latency: Duration) -> Arc<Registry> {
        let registry = Arc::new(Registry::new());
        self.add_responder(
            ResponderConfig::default(),
            registry.clone(),
            TestProbe::default(),
            latency,
        )
        .await;
        registry
    }

    /// Add a responder advertising a directory service.
    pub async fn add_directory(&self, instance_name: &str, endpoints: Endpoints, latency: Duration) {
        let config = ResponderConfig {
            domain_id: String::new(),
            instance_name: instance_name.to_string(),
            directory_endpoints: endpoints,
        };
        self.add_responder(
            config,
            Arc::new(Registry::new()),
            TestProbe::default(),
            latency,
        )
        .await;
    }

    pub async fn attach(&self, locator: &Locator<TestChannel>) {
        *self.locator.write().await = Some(locator.downgrade());
    }

    async fn deliver(self: &Arc<Self>, query: QueryMessage) {
        let nodes = self.nodes.read().await;
        for node in nodes.iter() {
            let responder = node.responder.clone();
            let latency = node.latency;
            let bus = self.clone();
            let query = query.clone();
            tokio::spawn(async move {
                sleep(latency).await;
                let Some(reply) = responder.handle_query(&query).await else {
                    return;
                };
                let locator = bus.locator.read().await.as_ref().and_then(|l| l.upgrade());
                if let Some(locator) = locator {
                    locator.handle_reply(reply).await;
                }
            });
        }
    }
}

/// Query channel on a [`TestBus`] that records what it sends.
#[derive(Clone)]
pub struct TestChannel {
    bus: Arc<TestBus>,
    index: usize,
    failing: Arc<AtomicBool>,
    sent: Arc<Mutex<Vec<QueryMessage>>>,
}

impl TestChannel {
    pub fn new(bus: Arc<TestBus>, index: usize) -> Self {
        Self {
            bus,
            index,
            failing: Arc::new(AtomicBool::new(false)),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn sent(&self) -> Vec<QueryMessage> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl QueryChannel for TestChannel {
    fn label(&self) -> String {
        format!("test/{}", self.index)
    }

    fn reply_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000 + self.index as u16))
    }

    async fn send_query(&self, query: &QueryMessage) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("channel {} is down", self.index);
        }
        self.sent.lock().await.push(query.clone());
        self.bus.deliver(query.clone()).await;
        Ok(())
    }
}

/// A locator on `bus` with `channel_count` channels. The returned channels
/// share state with the locator's, so tests can inspect and break them.
pub async fn test_locator(
    bus: &Arc<TestBus>,
    config: LocatorConfig,
    channel_count: usize,
) -> (Locator<TestChannel>, Vec<TestChannel>) {
    let channels: Vec<TestChannel> = (0..channel_count)
        .map(|index| TestChannel::new(bus.clone(), index))
        .collect();
    let locator = Locator::new(config, channels.clone());
    bus.attach(&locator).await;
    (locator, channels)
}

/// Directory transport answering from a script, falling back to `Ack`.
#[derive(Clone, Default)]
pub struct ScriptedDirectory {
    script: Arc<Mutex<VecDeque<Result<DirectoryResponse, RpcError>>>>,
    calls: Arc<Mutex<Vec<(DirectoryReference, DirectoryRequest)>>>,
}

impl ScriptedDirectory {
    pub async fn push(&self, result: Result<DirectoryResponse, RpcError>) {
        self.script.lock().await.push_back(result);
    }

    pub async fn calls(&self) -> Vec<(DirectoryReference, DirectoryRequest)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl DirectoryRpc for ScriptedDirectory {
    async fn call(
        &self,
        target: &DirectoryReference,
        request: DirectoryRequest,
    ) -> Result<DirectoryResponse, RpcError> {
        self.calls.lock().await.push((target.clone(), request));
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(DirectoryResponse::Ack))
    }
}
