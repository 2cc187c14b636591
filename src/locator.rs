//! The pending query table and reply demultiplexer.
//!
//! [`Locator`] is the client side of the discovery protocol. It keeps at most
//! one live [`QueryObject`] per [`QueryKey`]; every caller asking for a key
//! that is already being resolved joins the existing query's waiter list
//! instead of triggering another broadcast.
//!
//! Replies are pushed into the locator by the channel receive loops via
//! [`Locator::handle_datagram`]. They are deduplicated by reply id, matched to
//! their query by key and request id, and fed to the query's state machine.
//! Timer expiries come back through the shared [`Timer`], carrying the token
//! they were armed under. An expiry whose token is no longer the query's
//! armed timer is a no-op, whether its round was superseded or a merge
//! window was opened while the expiry waited for the table lock.
//!
//! The table lock is never held across a send: rounds are prepared under the
//! lock, the datagrams go out after it is released, and the send results are
//! reported back under the lock again.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures::future::join_all;
use lru::LruCache;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::channel::QueryChannel;
use crate::config::LocatorConfig;
use crate::core::{
    DirectoryReference, DiscoveryError, Endpoints, Identity, QueryKey, RequestId,
};
use crate::protocol::{Datagram, QueryMessage, ReplyMessage, ReplyPayload};
use crate::query::{Outcome, QueryObject, QueryParams, ReplyAction, Resolved, TimeoutAction};
use crate::timer::{Timer, TimerToken};

/// Number of recent reply ids remembered for duplicate suppression.
const SEEN_REPLY_CAPACITY: usize = 1024;

/// A resolution in progress. Resolves once the query completes, fails, or the
/// locator shuts down.
pub struct PendingResolution {
    rx: oneshot::Receiver<Outcome>,
}

impl Future for PendingResolution {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(DiscoveryError::Shutdown)))
    }
}

/// A broadcast round prepared under the table lock and sent after it.
struct Round {
    key: QueryKey,
    request_id: RequestId,
}

/// Replies collected by [`Locator::resolve_directory`].
struct Survey {
    instance_name: String,
    found: BTreeMap<String, Endpoints>,
}

impl Survey {
    fn absorb(&mut self, payload: ReplyPayload) {
        let ReplyPayload::Directory { reference } = payload else {
            return;
        };
        if !self.instance_name.is_empty() && reference.instance_name != self.instance_name {
            return;
        }
        self.found
            .entry(reference.instance_name)
            .or_default()
            .merge(&reference.endpoints);
    }

    fn into_references(self) -> Vec<DirectoryReference> {
        self.found
            .into_iter()
            .map(|(name, endpoints)| DirectoryReference::new(name, endpoints))
            .collect()
    }
}

struct LocatorInner<C: QueryChannel> {
    config: LocatorConfig,
    channels: Vec<C>,
    timer: Timer,
    /// The pending query table.
    pending: Mutex<HashMap<QueryKey, QueryObject>>,
    surveys: Mutex<HashMap<RequestId, Survey>>,
    seen_replies: Mutex<LruCache<Uuid, ()>>,
    directory_warned: Arc<AtomicBool>,
    shut_down: AtomicBool,
}

/// Client side of the discovery protocol.
///
/// The locator is a cheap handle around shared state; clone it freely into
/// receive loops and background tasks. Receive loops should hold a
/// [`WeakLocator`] so dropping the last handle stops them.
pub struct Locator<C: QueryChannel> {
    inner: Arc<LocatorInner<C>>,
}

impl<C: QueryChannel> Clone for Locator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Non-owning handle to a [`Locator`].
pub struct WeakLocator<C: QueryChannel> {
    inner: Weak<LocatorInner<C>>,
}

impl<C: QueryChannel> Clone for WeakLocator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: QueryChannel> WeakLocator<C> {
    pub fn upgrade(&self) -> Option<Locator<C>> {
        self.inner.upgrade().map(|inner| Locator { inner })
    }
}

impl<C: QueryChannel> Locator<C> {
    /// Create a locator broadcasting on `channels`.
    pub fn new(config: LocatorConfig, channels: Vec<C>) -> Self {
        let capacity = NonZeroUsize::new(SEEN_REPLY_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(LocatorInner {
                config,
                channels,
                timer: Timer::new(),
                pending: Mutex::new(HashMap::new()),
                surveys: Mutex::new(HashMap::new()),
                seen_replies: Mutex::new(LruCache::new(capacity)),
                directory_warned: Arc::new(AtomicBool::new(false)),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakLocator<C> {
        WeakLocator {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &LocatorConfig {
        &self.inner.config
    }

    pub fn channels(&self) -> &[C] {
        &self.inner.channels
    }

    /// Resolve the endpoints of an adapter or replica group.
    pub async fn resolve_adapter(&self, name: &str) -> Result<Endpoints, DiscoveryError> {
        let key = QueryKey::Adapter(name.to_string());
        let outcome = self.begin(key.clone()).await.await;
        into_endpoints(key, outcome)
    }

    /// Resolve the endpoints of a well-known object.
    pub async fn resolve_entity(&self, identity: &Identity) -> Result<Endpoints, DiscoveryError> {
        let key = QueryKey::Entity(identity.clone());
        let outcome = self.begin(key.clone()).await.await;
        into_endpoints(key, outcome)
    }

    /// Start resolving `key` with the locator's configured timing.
    ///
    /// Returns as soon as the caller is registered; await the returned
    /// [`PendingResolution`] for the outcome.
    pub async fn begin(&self, key: QueryKey) -> PendingResolution {
        let params = self.default_params();
        self.begin_with(key, params).await
    }

    /// Start resolving `key` with explicit timing parameters. Parameters only
    /// apply if no query for `key` is in flight yet.
    pub async fn begin_with(&self, key: QueryKey, params: QueryParams) -> PendingResolution {
        let (tx, rx) = oneshot::channel();
        let round = {
            let mut table = self.inner.pending.lock().await;
            // Checked under the table lock: shutdown raises the flag before
            // draining, so nothing is inserted after the drain.
            if self.inner.shut_down.load(Ordering::Acquire) {
                let _ = tx.send(Err(DiscoveryError::Shutdown));
                return PendingResolution { rx };
            }
            if let Some(query) = table.get_mut(&key) {
                trace!(%key, "joining query in flight");
                query.add_waiter(tx);
                None
            } else {
                let mut query =
                    QueryObject::new(key.clone(), params, self.inner.directory_warned.clone());
                query.add_waiter(tx);
                let round = self.inner.prepare_round(&mut query);
                table.insert(key, query);
                Some(round)
            }
        };

        if let Some(round) = round {
            self.inner.broadcast(round).await;
        }
        PendingResolution { rx }
    }

    /// Resolve `key`, giving up after `budget`.
    ///
    /// Running out of budget does not cancel the query; other waiters still
    /// get its outcome.
    pub async fn resolve_within(&self, key: QueryKey, budget: Duration) -> Outcome {
        let pending = self.begin(key).await;
        match timeout(budget, pending).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DiscoveryError::WaitBudgetExceeded),
        }
    }

    /// Resolve a single directory service reference.
    ///
    /// The first acceptable reply opens a merge window during which further
    /// replies from the same instance contribute endpoints.
    pub async fn locate_directory(
        &self,
        instance_name: &str,
        params: QueryParams,
    ) -> Result<DirectoryReference, DiscoveryError> {
        let key = QueryKey::Directory(instance_name.to_string());
        match self.begin_with(key.clone(), params).await.await? {
            Resolved::Directory(reference) => Ok(reference),
            Resolved::Endpoints(_) => Err(DiscoveryError::NotFound(key)),
        }
    }

    /// Collect every directory service that answers within `wait_budget`.
    ///
    /// Endpoints of replies sharing an instance name are unioned. An empty
    /// `instance_name` accepts every instance.
    pub async fn resolve_directory(
        &self,
        instance_name: &str,
        wait_budget: Duration,
    ) -> Vec<DirectoryReference> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Vec::new();
        }

        let request_id = RequestId::generate();
        {
            let mut surveys = self.inner.surveys.lock().await;
            surveys.insert(
                request_id,
                Survey {
                    instance_name: instance_name.to_string(),
                    found: BTreeMap::new(),
                },
            );
        }

        let key = QueryKey::Directory(instance_name.to_string());
        let failures = self.inner.send_on_all_channels(&key, request_id).await;
        if failures < self.inner.channels.len() {
            sleep(wait_budget).await;
        }

        let mut surveys = self.inner.surveys.lock().await;
        surveys
            .remove(&request_id)
            .map(Survey::into_references)
            .unwrap_or_default()
    }

    /// Entry point for raw datagrams received on a reply socket.
    pub async fn handle_datagram(&self, bytes: &[u8]) {
        match Datagram::decode(bytes) {
            Ok(Datagram::Reply(reply)) => self.handle_reply(reply).await,
            Ok(Datagram::Query(_)) => {}
            Err(err) => debug!("dropping undecodable datagram: {err}"),
        }
    }

    /// Route a reply to the query or survey it answers.
    pub async fn handle_reply(&self, reply: ReplyMessage) {
        self.inner.handle_reply(reply).await;
    }

    /// Number of queries currently in flight.
    pub async fn pending_queries(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Fail every pending query with [`DiscoveryError::Shutdown`] and cancel
    /// all timers. Later resolve calls fail immediately.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        let drained: Vec<QueryObject> = {
            let mut table = self.inner.pending.lock().await;
            table.drain().map(|(_, query)| query).collect()
        };
        self.inner.timer.cancel_all();
        debug!(pending = drained.len(), "locator shutting down");
        for query in drained {
            query.finish(Err(DiscoveryError::Shutdown));
        }
    }

    fn default_params(&self) -> QueryParams {
        QueryParams {
            timeout: self.inner.config.timeout,
            retry_count: self.inner.config.retry_count,
            latency_multiplier: self.inner.config.latency_multiplier,
        }
    }
}

impl<C: QueryChannel> LocatorInner<C> {
    /// Start a new round on `query` and arm its timeout. Caller holds the
    /// table lock.
    fn prepare_round(self: &Arc<Self>, query: &mut QueryObject) -> Round {
        let request_id = query.begin_round(self.channels.len());
        let token = self.schedule_timeout(query.key().clone(), query.timeout());
        if let Some(previous) = query.set_timer(token) {
            self.timer.cancel(previous);
        }
        Round {
            key: query.key().clone(),
            request_id,
        }
    }

    fn schedule_timeout(self: &Arc<Self>, key: QueryKey, delay: Duration) -> TimerToken {
        let weak = Arc::downgrade(self);
        self.timer.schedule(delay, move |token| async move {
            if let Some(inner) = weak.upgrade() {
                inner.on_timeout(key, token).await;
            }
        })
    }

    /// Send a prepared round and fail fast if no channel could send it.
    async fn broadcast(self: &Arc<Self>, round: Round) {
        let failures = self
            .send_on_all_channels(&round.key, round.request_id)
            .await;
        if failures == 0 {
            return;
        }

        let mut table = self.pending.lock().await;
        let all_failed = match table.get_mut(&round.key) {
            Some(query) => query.record_send_failures(round.request_id, failures),
            None => false,
        };
        if !all_failed {
            return;
        }
        if let Some(mut query) = table.remove(&round.key) {
            drop(table);
            if let Some(token) = query.take_timer() {
                self.timer.cancel(token);
            }
            debug!(key = %round.key, "every channel failed to send; failing fast");
            query.finish(Err(DiscoveryError::NoNetworkPath(round.key)));
        }
    }

    /// Send a query on every channel concurrently. Returns how many failed.
    async fn send_on_all_channels(&self, key: &QueryKey, request_id: RequestId) -> usize {
        let sends = self.channels.iter().map(|channel| {
            let query = QueryMessage {
                domain_id: self.config.domain_id.clone(),
                request_id,
                key: key.clone(),
                reply_to: channel.reply_addr(),
            };
            async move {
                let result = channel.send_query(&query).await;
                if let Err(err) = &result {
                    debug!(channel = %channel.label(), %key, "query send failed: {err:?}");
                }
                result.is_err()
            }
        });
        let results = join_all(sends).await;
        trace!(%key, %request_id, channels = results.len(), "broadcast query");
        results.into_iter().filter(|failed| *failed).count()
    }

    async fn handle_reply(self: &Arc<Self>, reply: ReplyMessage) {
        {
            let mut seen = self.seen_replies.lock().await;
            if seen.put(reply.reply_id, ()).is_some() {
                trace!(reply_id = %reply.reply_id, "dropping duplicate reply");
                return;
            }
        }

        {
            let mut surveys = self.surveys.lock().await;
            if let Some(survey) = surveys.get_mut(&reply.request_id) {
                survey.absorb(reply.payload);
                return;
            }
        }

        let mut table = self.pending.lock().await;
        let Some(query) = table.get_mut(&reply.key) else {
            trace!(key = %reply.key, request_id = %reply.request_id, "reply for no pending query");
            return;
        };

        match query.on_reply(reply.request_id, reply.payload) {
            ReplyAction::Ignore | ReplyAction::Merged => {}
            ReplyAction::OpenMergeWindow(window) => {
                let token = self.schedule_timeout(reply.key.clone(), window);
                if let Some(previous) = query.set_timer(token) {
                    self.timer.cancel(previous);
                }
            }
            ReplyAction::Complete(resolved) => {
                if let Some(mut query) = table.remove(&reply.key) {
                    drop(table);
                    if let Some(token) = query.take_timer() {
                        self.timer.cancel(token);
                    }
                    query.finish(Ok(resolved));
                }
            }
        }
    }

    async fn on_timeout(self: Arc<Self>, key: QueryKey, token: TimerToken) {
        let round = {
            let mut table = self.pending.lock().await;
            let Some(query) = table.get_mut(&key) else {
                return;
            };
            if query.timer() != Some(token) {
                trace!(%key, "ignoring expiry of a replaced timer");
                return;
            }
            query.take_timer();

            match query.on_timeout() {
                TimeoutAction::Retry => {
                    debug!(%key, round = query.rounds() + 1, "query timed out; rebroadcasting");
                    self.prepare_round(query)
                }
                TimeoutAction::Complete(resolved) => {
                    if let Some(query) = table.remove(&key) {
                        drop(table);
                        query.finish(Ok(resolved));
                    }
                    return;
                }
                TimeoutAction::Fail => {
                    if let Some(query) = table.remove(&key) {
                        drop(table);
                        debug!(%key, rounds = query.rounds(), "query exhausted its retries");
                        query.finish(Err(DiscoveryError::NotFound(key)));
                    }
                    return;
                }
            }
        };
        self.broadcast(round).await;
    }
}

fn into_endpoints(key: QueryKey, outcome: Outcome) -> Result<Endpoints, DiscoveryError> {
    match outcome? {
        Resolved::Endpoints(endpoints) => Ok(endpoints),
        Resolved::Directory(_) => Err(DiscoveryError::NotFound(key)),
    }
}
