use crate::error::ShardingError;
use crate::types::{PodAddress, ShardId};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

/// Access to the store through which the Shard Manager publishes assignment
/// changes. The stream is lazy and restartable: each call yields the current
/// assignments first, then subsequent changes.
#[async_trait]
pub trait AssignmentStorage: Send + Sync {
    async fn assignments_stream(
        &self,
    ) -> Result<BoxStream<'static, HashMap<ShardId, Option<PodAddress>>>, ShardingError>;
}

/// In-memory assignment store for single-pod deployments and tests.
pub struct MemoryAssignmentStorage {
    tx: watch::Sender<HashMap<ShardId, Option<PodAddress>>>,
}

impl MemoryAssignmentStorage {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HashMap::new());
        Self { tx }
    }

    /// Publish a new assignment map to every subscriber.
    pub fn publish(&self, assignments: HashMap<ShardId, Option<PodAddress>>) {
        let _ = self.tx.send(assignments);
    }
}

impl Default for MemoryAssignmentStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssignmentStorage for MemoryAssignmentStorage {
    async fn assignments_stream(
        &self,
    ) -> Result<BoxStream<'static, HashMap<ShardId, Option<PodAddress>>>, ShardingError> {
        Ok(WatchStream::new(self.tx.subscribe()).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_yields_current_then_changes() {
        let storage = MemoryAssignmentStorage::new();
        let mut stream = storage.assignments_stream().await.unwrap();

        // Current (empty) state arrives first.
        let first = stream.next().await.unwrap();
        assert!(first.is_empty());

        let pod = PodAddress::new("localhost", 54321);
        storage.publish(HashMap::from([(ShardId(1), Some(pod.clone()))]));
        let second = stream.next().await.unwrap();
        assert_eq!(second[&ShardId(1)], Some(pod));
    }

    #[tokio::test]
    async fn stream_is_restartable() {
        let storage = MemoryAssignmentStorage::new();
        storage.publish(HashMap::from([(ShardId(2), None)]));

        let mut stream = storage.assignments_stream().await.unwrap();
        let current = stream.next().await.unwrap();
        assert!(current.contains_key(&ShardId(2)));
    }
}
