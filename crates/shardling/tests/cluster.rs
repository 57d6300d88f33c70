//! Two-pod routing through the in-process loopback transport: remote
//! dispatch, connection pooling, and streamed replies across pods.

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use shardling::entity_manager::{EntityContext, EntityOptions};
use shardling::error::ShardingError;
use shardling::metrics::ShardingMetrics;
use shardling::pods::Pods;
use shardling::reply::{Replier, StreamReplier};
use shardling::shard_manager::ShardManagerClient;
use shardling::storage::MemoryAssignmentStorage;
use shardling::testing::{LoopbackPods, PodNetwork};
use shardling::{PodAddress, Sharding, ShardId, ShardingConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum EchoMsg {
    Echo {
        text: String,
        replier: Replier<String>,
    },
    Range {
        upto: u64,
        replier: StreamReplier<u64>,
    },
}

fn echo_behavior() -> impl Fn(
    EntityContext,
    mpsc::UnboundedReceiver<EchoMsg>,
) -> futures::future::BoxFuture<'static, Result<(), ShardingError>>
       + Send
       + Sync
       + 'static {
    |ctx: EntityContext, mut mailbox: mpsc::UnboundedReceiver<EchoMsg>| {
        async move {
            while let Some(msg) = mailbox.recv().await {
                match msg {
                    EchoMsg::Echo { text, replier } => ctx.reply(&replier, text),
                    EchoMsg::Range { upto, replier } => {
                        ctx.reply_stream(&replier, futures::stream::iter(0..upto).boxed())
                            .await;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }
}

/// Shard manager with a fixed split of shards across two pods.
struct SplitShardManager {
    assignments: HashMap<ShardId, Option<PodAddress>>,
}

#[async_trait]
impl ShardManagerClient for SplitShardManager {
    async fn register(&self, _pod: &PodAddress) -> Result<(), ShardingError> {
        Ok(())
    }
    async fn unregister(&self, _pod: &PodAddress) -> Result<(), ShardingError> {
        Ok(())
    }
    async fn get_assignments(
        &self,
    ) -> Result<HashMap<ShardId, Option<PodAddress>>, ShardingError> {
        Ok(self.assignments.clone())
    }
    async fn notify_unhealthy_pod(&self, _pod: &PodAddress) -> Result<(), ShardingError> {
        Ok(())
    }
}

fn split_assignments(p1: &PodAddress, p2: &PodAddress) -> HashMap<ShardId, Option<PodAddress>> {
    (1..=8)
        .map(|shard| {
            let owner = if shard % 2 == 1 { p1.clone() } else { p2.clone() };
            (ShardId(shard), Some(owner))
        })
        .collect()
}

async fn pod(
    network: &PodNetwork,
    host: &str,
    assignments: &HashMap<ShardId, Option<PodAddress>>,
) -> (Arc<Sharding>, Arc<LoopbackPods>) {
    let config = ShardingConfig {
        number_of_shards: 8,
        self_host: host.to_string(),
        sharding_port: 54321,
        ..Default::default()
    };
    let transport = network.transport();
    let sharding = Sharding::new(
        config,
        Arc::clone(&transport) as Arc<dyn Pods>,
        Arc::new(SplitShardManager {
            assignments: assignments.clone(),
        }),
        Arc::new(MemoryAssignmentStorage::new()),
        Arc::new(ShardingMetrics::unregistered()),
    )
    .unwrap();
    network.add(&sharding);
    sharding.register().await.unwrap();
    sharding
        .register_entity("Echo", echo_behavior(), EntityOptions::default())
        .unwrap();
    (sharding, transport)
}

fn id_owned_by(
    sharding: &Sharding,
    assignments: &HashMap<ShardId, Option<PodAddress>>,
    pod: &PodAddress,
) -> String {
    (0..1000)
        .map(|i| format!("user-{i}"))
        .find(|id| {
            assignments
                .get(&sharding.get_shard_id("Echo", id))
                .and_then(|owner| owner.as_ref())
                == Some(pod)
        })
        .expect("some entity id should map to the pod")
}

#[tokio::test]
async fn remote_send_round_trips_and_pools_one_connection() {
    let p1 = PodAddress::new("10.0.0.1", 54321);
    let p2 = PodAddress::new("10.0.0.2", 54321);
    let assignments = split_assignments(&p1, &p2);

    let network = PodNetwork::new();
    let (s1, t1) = pod(&network, "10.0.0.1", &assignments).await;
    let (_s2, _t2) = pod(&network, "10.0.0.2", &assignments).await;

    let messenger = s1.messenger::<EchoMsg>("Echo").unwrap();
    let remote_id = id_owned_by(&s1, &assignments, &p2);

    for round in 0..3 {
        let echoed = messenger
            .send::<String>(&remote_id, |replier| EchoMsg::Echo {
                text: format!("ping-{round}"),
                replier,
            })
            .await
            .unwrap();
        assert_eq!(echoed, format!("ping-{round}"));
    }

    // Every send reused the single pooled peer connection.
    assert_eq!(t1.pooled_connections(), 1);

    // Local ids bypass the transport entirely.
    let local_id = id_owned_by(&s1, &assignments, &p1);
    messenger
        .send::<String>(&local_id, |replier| EchoMsg::Echo {
            text: "home".into(),
            replier,
        })
        .await
        .unwrap();
    assert_eq!(t1.pooled_connections(), 1);
}

#[tokio::test]
async fn streamed_reply_crosses_pods() {
    let p1 = PodAddress::new("10.0.0.1", 54321);
    let p2 = PodAddress::new("10.0.0.2", 54321);
    let assignments = split_assignments(&p1, &p2);

    let network = PodNetwork::new();
    let (s1, _t1) = pod(&network, "10.0.0.1", &assignments).await;
    let (_s2, _t2) = pod(&network, "10.0.0.2", &assignments).await;

    let messenger = s1.messenger::<EchoMsg>("Echo").unwrap();
    let remote_id = id_owned_by(&s1, &assignments, &p2);

    let output = messenger.send_stream::<u64>(&remote_id, |replier| EchoMsg::Range {
        upto: 4,
        replier,
    });
    let chunks: Vec<u64> = output.map(|chunk| chunk.unwrap()).collect().await;
    assert_eq!(chunks, vec![0, 1, 2, 3]);
}
