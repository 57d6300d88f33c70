use crate::error::ShardingError;
use crate::types::{PodAddress, ShardId};
use async_trait::async_trait;
use std::collections::HashMap;

/// Client for the external Shard Manager, the authority on shard assignments.
#[async_trait]
pub trait ShardManagerClient: Send + Sync {
    /// Announce this pod to the Shard Manager.
    async fn register(&self, pod: &PodAddress) -> Result<(), ShardingError>;

    /// Remove this pod from the Shard Manager. Called during drain.
    async fn unregister(&self, pod: &PodAddress) -> Result<(), ShardingError>;

    /// Fetch the authoritative shard assignment snapshot.
    async fn get_assignments(&self)
        -> Result<HashMap<ShardId, Option<PodAddress>>, ShardingError>;

    /// Report that a peer pod appears unreachable. The caller debounces.
    async fn notify_unhealthy_pod(&self, pod: &PodAddress) -> Result<(), ShardingError>;
}

/// In-process Shard Manager for single-pod deployments and tests: every
/// shard is assigned to the one registered pod.
pub struct LocalShardManagerClient {
    pod: PodAddress,
    number_of_shards: u32,
    unhealthy_reports: parking_lot::Mutex<Vec<PodAddress>>,
}

impl LocalShardManagerClient {
    pub fn new(pod: PodAddress, number_of_shards: u32) -> Self {
        Self {
            pod,
            number_of_shards,
            unhealthy_reports: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Pods reported unhealthy so far, in report order.
    pub fn unhealthy_reports(&self) -> Vec<PodAddress> {
        self.unhealthy_reports.lock().clone()
    }
}

#[async_trait]
impl ShardManagerClient for LocalShardManagerClient {
    async fn register(&self, _pod: &PodAddress) -> Result<(), ShardingError> {
        Ok(())
    }

    async fn unregister(&self, _pod: &PodAddress) -> Result<(), ShardingError> {
        Ok(())
    }

    async fn get_assignments(
        &self,
    ) -> Result<HashMap<ShardId, Option<PodAddress>>, ShardingError> {
        Ok((1..=self.number_of_shards)
            .map(|shard| (ShardId(shard), Some(self.pod.clone())))
            .collect())
    }

    async fn notify_unhealthy_pod(&self, pod: &PodAddress) -> Result<(), ShardingError> {
        self.unhealthy_reports.lock().push(pod.clone());
        Ok(())
    }
}
