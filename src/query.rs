//! Query objects and the per-query state machine.
//!
//! A [`QueryObject`] tracks one key while it is being resolved:
//!
//! ```text
//! Querying ──reply──▶ Resolved
//!    │  └──replica reply──▶ Merging ──deadline──▶ Resolved
//!    ├──timeout, retries left──▶ Querying (new request id)
//!    ├──timeout, exhausted──▶ Failed
//!    └──every channel failed to send──▶ Failed
//! ```
//!
//! The object itself performs no I/O and never touches the timer. The locator
//! calls its step functions while holding the pending-table lock and carries
//! out the returned action (resend, reschedule, complete).
//!
//! The three query flavors share this driver; what differs is how a reply is
//! validated and merged, which is isolated in [`Flavor`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::core::{DirectoryReference, DiscoveryError, Endpoints, QueryKey, RequestId};
use crate::protocol::ReplyPayload;
use crate::timer::TimerToken;

/// Value a successful query resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolved {
    Endpoints(Endpoints),
    Directory(DirectoryReference),
}

pub type Outcome = Result<Resolved, DiscoveryError>;

/// Retry and merge-window parameters fixed when a query is created.
#[derive(Clone, Copy, Debug)]
pub struct QueryParams {
    pub timeout: Duration,
    pub retry_count: u32,
    pub latency_multiplier: u32,
}

/// What the locator must do after feeding a reply to a query.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplyAction {
    /// Reply was stale, foreign or invalid.
    Ignore,
    /// The query is done.
    Complete(Resolved),
    /// First candidate of a merge; reschedule the timer to this window.
    OpenMergeWindow(Duration),
    /// Candidate added to an already open merge window.
    Merged,
}

/// What the locator must do when the query's timer fires.
#[derive(Debug, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Merge window closed with at least one candidate.
    Complete(Resolved),
    /// Rebroadcast with a new request id.
    Retry,
    /// Retries exhausted.
    Fail,
}

/// Flavor-specific reply handling.
enum Flavor {
    /// Well-known object; resolves on the first reply.
    Entity,
    /// Adapter or replica group. Replica replies accumulate until the merge
    /// window closes.
    Adapter { accumulated: Vec<Endpoints> },
    /// Directory service. The first accepted reply fixes the instance name for
    /// the round; later replies of the same instance union their endpoints.
    Directory {
        accepted: Option<DirectoryReference>,
        warned: Arc<AtomicBool>,
    },
}

impl Flavor {
    fn for_key(key: &QueryKey, warned: Arc<AtomicBool>) -> Self {
        match key {
            QueryKey::Entity(_) => Flavor::Entity,
            QueryKey::Adapter(_) => Flavor::Adapter {
                accumulated: Vec::new(),
            },
            QueryKey::Directory(_) => Flavor::Directory {
                accepted: None,
                warned,
            },
        }
    }

    fn reset(&mut self) {
        match self {
            Flavor::Entity => {}
            Flavor::Adapter { accumulated } => accumulated.clear(),
            Flavor::Directory { accepted, .. } => *accepted = None,
        }
    }

    fn is_merging(&self) -> bool {
        match self {
            Flavor::Entity => false,
            Flavor::Adapter { accumulated } => !accumulated.is_empty(),
            Flavor::Directory { accepted, .. } => accepted.is_some(),
        }
    }

    fn merged(&self) -> Option<Resolved> {
        match self {
            Flavor::Entity => None,
            Flavor::Adapter { accumulated } => {
                let (first, rest) = accumulated.split_first()?;
                let mut endpoints = first.clone();
                for candidate in rest {
                    endpoints.merge(candidate);
                }
                Some(Resolved::Endpoints(endpoints))
            }
            Flavor::Directory { accepted, .. } => accepted.clone().map(Resolved::Directory),
        }
    }
}

/// A live query registered in the pending query table.
pub struct QueryObject {
    key: QueryKey,
    request_id: RequestId,
    retries_remaining: u32,
    rounds: u32,
    sent_at: Instant,
    waiters: Vec<oneshot::Sender<Outcome>>,
    timer: Option<TimerToken>,
    channel_failures: usize,
    channel_total: usize,
    params: QueryParams,
    flavor: Flavor,
}

impl QueryObject {
    /// Create a query for `key`. `directory_warned` is the resolver-wide flag
    /// that keeps instance-name mismatches from flooding the log.
    pub fn new(key: QueryKey, params: QueryParams, directory_warned: Arc<AtomicBool>) -> Self {
        let flavor = Flavor::for_key(&key, directory_warned);
        Self {
            key,
            request_id: RequestId::generate(),
            retries_remaining: params.retry_count,
            rounds: 0,
            sent_at: Instant::now(),
            waiters: Vec::new(),
            timer: None,
            channel_failures: 0,
            channel_total: 0,
            params,
            flavor,
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn timeout(&self) -> Duration {
        self.params.timeout
    }

    pub fn is_merging(&self) -> bool {
        self.flavor.is_merging()
    }

    pub fn add_waiter(&mut self, waiter: oneshot::Sender<Outcome>) {
        self.waiters.push(waiter);
    }

    /// Replace the armed timer, returning the previous token for cancellation.
    pub fn set_timer(&mut self, token: TimerToken) -> Option<TimerToken> {
        self.timer.replace(token)
    }

    /// The timer currently armed for this query, if any.
    pub fn timer(&self) -> Option<TimerToken> {
        self.timer
    }

    pub fn take_timer(&mut self) -> Option<TimerToken> {
        self.timer.take()
    }

    /// Enter a new broadcast round: fresh request id, cleared failure count
    /// and merge state. Replies to any earlier round no longer match.
    pub fn begin_round(&mut self, channel_total: usize) -> RequestId {
        self.request_id = RequestId::generate();
        self.rounds += 1;
        self.sent_at = Instant::now();
        self.channel_failures = 0;
        self.channel_total = channel_total;
        self.flavor.reset();
        self.request_id
    }

    /// Record how many channels failed to send the round `request_id`.
    /// Returns `true` when every channel failed and the query should fail
    /// without waiting for its timer.
    pub fn record_send_failures(&mut self, request_id: RequestId, failures: usize) -> bool {
        if request_id != self.request_id {
            return false;
        }
        self.channel_failures += failures;
        self.channel_failures >= self.channel_total
    }

    /// Feed a reply to the query.
    pub fn on_reply(&mut self, request_id: RequestId, payload: ReplyPayload) -> ReplyAction {
        if request_id != self.request_id {
            trace!(key = %self.key, %request_id, current = %self.request_id, "dropping stale reply");
            return ReplyAction::Ignore;
        }

        let latency = self.sent_at.elapsed();
        let window = latency * self.params.latency_multiplier;
        let key = &self.key;

        match (&mut self.flavor, payload) {
            (Flavor::Entity, ReplyPayload::Entity { endpoints }) => {
                ReplyAction::Complete(Resolved::Endpoints(endpoints))
            }
            (
                Flavor::Adapter { accumulated },
                ReplyPayload::Adapter {
                    endpoints,
                    is_replica_group,
                },
            ) => {
                if !is_replica_group {
                    return ReplyAction::Complete(Resolved::Endpoints(endpoints));
                }
                accumulated.push(endpoints);
                if accumulated.len() == 1 {
                    debug!(%key, ?latency, ?window, "opening replica merge window");
                    ReplyAction::OpenMergeWindow(window)
                } else {
                    ReplyAction::Merged
                }
            }
            (Flavor::Directory { accepted, warned }, ReplyPayload::Directory { reference }) => {
                let expected = match key {
                    QueryKey::Directory(name) if !name.is_empty() => Some(name.as_str()),
                    _ => accepted.as_ref().map(|r| r.instance_name.as_str()),
                };
                if let Some(expected) = expected {
                    if reference.instance_name != expected {
                        if !warned.swap(true, Ordering::Relaxed) {
                            warn!(
                                expected,
                                received = %reference.instance_name,
                                "ignoring directory reply with a different instance name"
                            );
                        }
                        return ReplyAction::Ignore;
                    }
                }
                if let Some(existing) = accepted.as_mut() {
                    existing.endpoints.merge(&reference.endpoints);
                    return ReplyAction::Merged;
                }
                *accepted = Some(reference);
                ReplyAction::OpenMergeWindow(window)
            }
            (_, payload) => {
                debug!(%key, ?payload, "dropping reply of the wrong kind");
                ReplyAction::Ignore
            }
        }
    }

    /// Handle a timer expiry for the current round.
    pub fn on_timeout(&mut self) -> TimeoutAction {
        if let Some(resolved) = self.flavor.merged() {
            return TimeoutAction::Complete(resolved);
        }
        if self.retries_remaining > 0 {
            self.retries_remaining -= 1;
            TimeoutAction::Retry
        } else {
            TimeoutAction::Fail
        }
    }

    /// Deliver `outcome` to every waiter. Waiters that went away are skipped.
    pub fn finish(self, outcome: Outcome) {
        debug!(key = %self.key, rounds = self.rounds, ok = outcome.is_ok(), "query finished");
        for waiter in self.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}
