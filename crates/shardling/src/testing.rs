//! Single-pod in-memory fixture for unit and integration testing.
//!
//! Wires a [`Sharding`] to a local shard manager that assigns every shard to
//! this pod, an in-memory assignment store, a transport stub, and
//! unregistered metrics. Entities can be registered and messaged without any
//! external dependency.

use crate::config::ShardingConfig;
use crate::connection_cache::{ConnectionCache, Connector};
use crate::envelope::BinaryMessage;
use crate::error::ShardingError;
use crate::metrics::ShardingMetrics;
use crate::pods::{NoopPods, Pods};
use crate::shard_manager::{LocalShardManagerClient, ShardManagerClient};
use crate::sharding::Sharding;
use crate::storage::{AssignmentStorage, MemoryAssignmentStorage};
use crate::types::{PodAddress, ShardId};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;

/// A single-pod in-memory sharding runtime.
///
/// # Example
///
/// ```ignore
/// let fixture = TestSharding::new().await;
/// fixture.sharding().register_entity("Counter", behavior, EntityOptions::default())?;
/// let messenger = fixture.sharding().messenger::<CounterMsg>("Counter")?;
/// ```
pub struct TestSharding {
    sharding: Arc<Sharding>,
    shard_manager: Arc<LocalShardManagerClient>,
    storage: Arc<MemoryAssignmentStorage>,
}

impl TestSharding {
    /// Build and register a fixture with default configuration.
    pub async fn new() -> Self {
        Self::with_config(ShardingConfig::default()).await
    }

    /// Build and register a fixture with custom configuration.
    pub async fn with_config(config: ShardingConfig) -> Self {
        let shard_manager = Arc::new(LocalShardManagerClient::new(
            config.self_address(),
            config.number_of_shards,
        ));
        let storage = Arc::new(MemoryAssignmentStorage::new());
        let metrics = Arc::new(ShardingMetrics::unregistered());
        let sharding = Sharding::new(
            config,
            Arc::new(NoopPods),
            Arc::clone(&shard_manager) as Arc<dyn ShardManagerClient>,
            Arc::clone(&storage) as Arc<dyn AssignmentStorage>,
            metrics,
        )
        .expect("TestSharding config should be valid");
        sharding
            .register()
            .await
            .expect("local shard manager registration cannot fail");
        Self {
            sharding,
            shard_manager,
            storage,
        }
    }

    pub fn sharding(&self) -> &Arc<Sharding> {
        &self.sharding
    }

    pub fn shard_manager(&self) -> &Arc<LocalShardManagerClient> {
        &self.shard_manager
    }

    pub fn storage(&self) -> &Arc<MemoryAssignmentStorage> {
        &self.storage
    }

    /// Drain the pod, as `unregister` would in production.
    pub async fn shutdown(&self) {
        self.sharding.unregister().await;
    }
}

/// In-process pod directory for multi-pod tests.
///
/// Create one transport per pod (before its [`Sharding`]), then `add` the
/// pod so peers can reach it by address.
pub struct PodNetwork {
    directory: Arc<DashMap<PodAddress, Arc<Sharding>>>,
}

impl PodNetwork {
    pub fn new() -> Self {
        Self {
            directory: Arc::new(DashMap::new()),
        }
    }

    /// Transport handle for one pod, resolving peers against this network.
    pub fn transport(&self) -> Arc<LoopbackPods> {
        let directory = Arc::clone(&self.directory);
        let connector: Connector<Arc<Sharding>> = Arc::new(move |pod: PodAddress| {
            let directory = Arc::clone(&directory);
            Box::pin(async move {
                match directory.get(&pod) {
                    Some(entry) => Ok(Arc::clone(entry.value())),
                    None => Err(ShardingError::PodUnavailable { address: pod }),
                }
            })
        });
        Arc::new(LoopbackPods {
            cache: ConnectionCache::new(connector),
        })
    }

    /// Make a pod reachable under its self address.
    pub fn add(&self, sharding: &Arc<Sharding>) {
        self.directory
            .insert(sharding.self_address().clone(), Arc::clone(sharding));
    }
}

impl Default for PodNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport that delivers to in-process peers.
///
/// Peer handles stand in for network connections and are pooled through a
/// [`ConnectionCache`], the way a production transport pools its channels.
/// An address missing from the network maps to `PodUnavailable`, matching
/// the status-code translation contract of [`Pods`].
pub struct LoopbackPods {
    cache: ConnectionCache<Arc<Sharding>>,
}

impl LoopbackPods {
    /// Number of peer connections currently pooled.
    pub fn pooled_connections(&self) -> usize {
        self.cache.len()
    }
}

#[async_trait]
impl Pods for LoopbackPods {
    async fn assign_shards(
        &self,
        pod: &PodAddress,
        shards: &HashSet<ShardId>,
    ) -> Result<(), ShardingError> {
        let peer = self.cache.get(pod).await?;
        peer.assign_shards(shards).await;
        Ok(())
    }

    async fn unassign_shards(
        &self,
        pod: &PodAddress,
        shards: &HashSet<ShardId>,
    ) -> Result<(), ShardingError> {
        let peer = self.cache.get(pod).await?;
        peer.unassign_shards(shards).await;
        Ok(())
    }

    async fn ping(&self, pod: &PodAddress) -> Result<(), ShardingError> {
        self.cache.get(pod).await.map(|_| ())
    }

    async fn send_message(
        &self,
        pod: &PodAddress,
        message: BinaryMessage,
    ) -> Result<Option<Vec<u8>>, ShardingError> {
        let peer = self.cache.get(pod).await?;
        peer.receive_message(message).await
    }

    async fn send_stream(
        &self,
        pod: &PodAddress,
        _entity_id: &str,
        messages: BoxStream<'static, BinaryMessage>,
    ) -> Result<Option<Vec<u8>>, ShardingError> {
        let peer = self.cache.get(pod).await?;
        peer.receive_stream(messages).await
    }

    async fn send_message_and_receive_stream(
        &self,
        pod: &PodAddress,
        message: BinaryMessage,
    ) -> Result<BoxStream<'static, Result<Vec<u8>, ShardingError>>, ShardingError> {
        let peer = self.cache.get(pod).await?;
        Ok(peer.receive_message_streamed(message).await?.boxed())
    }

    async fn send_stream_and_receive_stream(
        &self,
        pod: &PodAddress,
        _entity_id: &str,
        messages: BoxStream<'static, BinaryMessage>,
    ) -> Result<BoxStream<'static, Result<Vec<u8>, ShardingError>>, ShardingError> {
        let peer = self.cache.get(pod).await?;
        Ok(peer.receive_stream_streamed(messages).await?.boxed())
    }
}
