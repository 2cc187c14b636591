//! In-memory registry of adapters and replica groups.
//!
//! The registry is soft state: nothing is persisted and the contents are
//! rebuilt by re-registration after a restart. All reads and writes go through
//! a single lock, and the lock is never held while probing remote objects.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::core::{Endpoints, Identity, RpcError};

/// Liveness check used before handing out an entity location.
#[async_trait]
pub trait EntityProbe: Send + Sync + 'static {
    /// Succeeds when `identity` answers at `endpoints`.
    async fn ping(&self, endpoints: &Endpoints, identity: &Identity) -> Result<(), RpcError>;
}

#[derive(Default)]
struct RegistryState {
    adapters: HashMap<String, Endpoints>,
    /// Replica group name to member adapter names.
    replica_groups: HashMap<String, BTreeSet<String>>,
}

impl RegistryState {
    fn lookup_adapter(&self, name: &str) -> Option<(Endpoints, bool)> {
        if let Some(endpoints) = self.adapters.get(name) {
            return Some((endpoints.clone(), false));
        }

        let members = self.replica_groups.get(name)?;
        let mut merged: Option<Endpoints> = None;
        for member in members {
            let Some(endpoints) = self.adapters.get(member) else {
                warn!(group = name, adapter = %member, "replica group member has no registered adapter");
                continue;
            };
            match merged.as_mut() {
                Some(all) => all.merge(endpoints),
                None => merged = Some(endpoints.clone()),
            }
        }
        merged.map(|endpoints| (endpoints, true))
    }
}

/// Adapter and replica group store answering lookups locally.
pub struct Registry {
    state: Mutex<RegistryState>,
    rng: Mutex<StdRng>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create a registry whose replica tie-break is driven by `rng`.
    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            rng: Mutex::new(rng),
        }
    }

    /// Register (or replace) the endpoints of an adapter.
    pub async fn register_adapter(&self, name: &str, endpoints: Endpoints) {
        let mut state = self.state.lock().await;
        debug!(adapter = name, %endpoints, "registering adapter");
        state.adapters.insert(name.to_string(), endpoints);
    }

    /// Register an adapter and add it to a replica group in one step.
    pub async fn register_replicated_adapter(&self, name: &str, group: &str, endpoints: Endpoints) {
        let mut state = self.state.lock().await;
        debug!(adapter = name, group, %endpoints, "registering replicated adapter");
        state.adapters.insert(name.to_string(), endpoints);
        state
            .replica_groups
            .entry(group.to_string())
            .or_default()
            .insert(name.to_string());
    }

    /// Remove an adapter and its membership in every replica group. Groups
    /// left without members are removed.
    pub async fn unregister_adapter(&self, name: &str) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.adapters.remove(name).is_some();
        state.replica_groups.retain(|_, members| {
            members.remove(name);
            !members.is_empty()
        });
        debug!(adapter = name, removed, "unregistered adapter");
        removed
    }

    pub async fn register_replica_member(&self, group: &str, adapter: &str) {
        let mut state = self.state.lock().await;
        state
            .replica_groups
            .entry(group.to_string())
            .or_default()
            .insert(adapter.to_string());
    }

    pub async fn unregister_replica_member(&self, group: &str, adapter: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(members) = state.replica_groups.get_mut(group) else {
            return false;
        };
        let removed = members.remove(adapter);
        if members.is_empty() {
            state.replica_groups.remove(group);
        }
        removed
    }

    /// Look up an adapter or replica group.
    ///
    /// A replica group resolves to the union of its members' endpoints and is
    /// flagged with `true`. Members without a registered adapter are skipped.
    pub async fn lookup_adapter(&self, name: &str) -> Option<(Endpoints, bool)> {
        let state = self.state.lock().await;
        state.lookup_adapter(name)
    }

    /// Find a live location for `identity`.
    ///
    /// Every replica group is probed first; if any answers, one of the live
    /// groups is picked uniformly at random. Otherwise plain adapters are
    /// probed the same way.
    pub async fn lookup_entity<P: EntityProbe>(
        &self,
        identity: &Identity,
        probe: &P,
    ) -> Option<Endpoints> {
        let (groups, adapters) = {
            let state = self.state.lock().await;
            let groups: Vec<Endpoints> = state
                .replica_groups
                .keys()
                .filter_map(|group| state.lookup_adapter(group).map(|(endpoints, _)| endpoints))
                .collect();
            let adapters: Vec<Endpoints> = state.adapters.values().cloned().collect();
            (groups, adapters)
        };

        if let Some(found) = self.pick_live(groups, identity, probe).await {
            return Some(found);
        }
        self.pick_live(adapters, identity, probe).await
    }

    pub async fn adapter_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn replica_group_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state.replica_groups.keys().cloned().collect();
        names.sort();
        names
    }

    async fn pick_live<P: EntityProbe>(
        &self,
        candidates: Vec<Endpoints>,
        identity: &Identity,
        probe: &P,
    ) -> Option<Endpoints> {
        if candidates.is_empty() {
            return None;
        }
        let pings = candidates.iter().map(|endpoints| probe.ping(endpoints, identity));
        let results = join_all(pings).await;

        let live: Vec<Endpoints> = candidates
            .into_iter()
            .zip(results)
            .filter_map(|(endpoints, result)| match result {
                Ok(()) => Some(endpoints),
                Err(err) => {
                    debug!(%identity, %endpoints, "probe failed: {err}");
                    None
                }
            })
            .collect();

        let mut rng = self.rng.lock().await;
        live.choose(&mut *rng).cloned()
    }
}
