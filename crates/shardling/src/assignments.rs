use crate::types::{PodAddress, ShardId};
use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Authoritative local copy of the shard → pod map.
///
/// Reads are lock-free snapshots; updates are functional (copy, modify,
/// compare-and-swap via `rcu`). At most one pod per shard; an absent shard is
/// unassigned. Only the assignment refresher and the local assign/unassign
/// calls from the Shard Manager mutate this table, and peer updates from the
/// change stream never overwrite entries owned by this pod.
pub(crate) struct AssignmentTable {
    map: ArcSwap<HashMap<ShardId, PodAddress>>,
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self {
            map: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn get(&self, shard: ShardId) -> Option<PodAddress> {
        self.map.load().get(&shard).cloned()
    }

    /// Distinct pods currently holding at least one shard.
    pub fn pods(&self) -> HashSet<PodAddress> {
        self.map.load().values().cloned().collect()
    }

    pub fn is_owner(&self, shard: ShardId, pod: &PodAddress) -> bool {
        self.map.load().get(&shard) == Some(pod)
    }

    /// Shards currently owned by the given pod.
    pub fn owned_count(&self, pod: &PodAddress) -> usize {
        self.map.load().values().filter(|p| *p == pod).count()
    }

    /// Record local ownership of the given shards.
    pub fn assign(&self, shards: &HashSet<ShardId>, pod: &PodAddress) {
        self.map.rcu(|current| {
            let mut next = HashMap::clone(current);
            for shard in shards {
                next.insert(*shard, pod.clone());
            }
            next
        });
    }

    /// Drop the given shards where the current owner is `pod`.
    pub fn unassign(&self, shards: &HashSet<ShardId>, pod: &PodAddress) {
        self.map.rcu(|current| {
            let mut next = HashMap::clone(current);
            for shard in shards {
                if next.get(shard) == Some(pod) {
                    next.remove(shard);
                }
            }
            next
        });
    }

    /// Replace the table with an authoritative Shard Manager snapshot.
    pub fn install(&self, snapshot: &HashMap<ShardId, Option<PodAddress>>) {
        let next: HashMap<ShardId, PodAddress> = snapshot
            .iter()
            .filter_map(|(shard, pod)| pod.clone().map(|pod| (*shard, pod)))
            .collect();
        self.map.store(Arc::new(next));
    }

    /// Merge a peer update from the change stream.
    ///
    /// Entries whose local value is `self_pod` are kept as-is: the Shard
    /// Manager changes this pod's ownership only through direct assign and
    /// unassign calls.
    pub fn merge(&self, update: &HashMap<ShardId, Option<PodAddress>>, self_pod: &PodAddress) {
        self.map.rcu(|current| {
            let mut next = HashMap::clone(current);
            for (shard, pod) in update {
                if next.get(shard) == Some(self_pod) {
                    continue;
                }
                match pod {
                    Some(pod) => {
                        next.insert(*shard, pod.clone());
                    }
                    None => {
                        next.remove(shard);
                    }
                }
            }
            next
        });
    }
}
