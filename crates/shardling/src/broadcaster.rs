//! Typed one-to-all-pods client for one topic type.

use crate::entity_manager::EntityManager;
use crate::error::ShardingError;
use crate::reply::{Replier, ReplyChannel, ReplyId};
use crate::sharding::Sharding;
use crate::types::PodAddress;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Fans a message out to every pod currently holding any shard. Obtained
/// from [`Sharding::broadcaster`].
pub struct Broadcaster<Msg> {
    sharding: Arc<Sharding>,
    manager: Arc<EntityManager<Msg>>,
    send_timeout: Option<Duration>,
}

impl<Msg> std::fmt::Debug for Broadcaster<Msg> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

impl<Msg> Broadcaster<Msg>
where
    Msg: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        sharding: Arc<Sharding>,
        manager: Arc<EntityManager<Msg>>,
        send_timeout: Option<Duration>,
    ) -> Self {
        Self {
            sharding,
            manager,
            send_timeout,
        }
    }

    pub fn with_send_timeout(mut self, send_timeout: Option<Duration>) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Broadcast a request and collect each pod's outcome.
    ///
    /// `make` is called once per pod so every leg carries its own replier.
    /// `Ok(None)` means the pod's topic entity completed without replying;
    /// timeouts and failures become that pod's `Err`. An empty assignment
    /// table yields an empty map.
    pub async fn broadcast<Res>(
        &self,
        topic_id: &str,
        make: impl Fn(Replier<Res>) -> Msg,
    ) -> HashMap<PodAddress, Result<Option<Res>, ShardingError>>
    where
        Res: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let pods = self.sharding.pods_snapshot();
        let make = &make;
        let legs = pods.into_iter().map(|pod| async move {
            let reply_id = ReplyId::random();
            let (channel, output) = ReplyChannel::<Res>::single();
            let msg = make(Replier::new(reply_id));
            let attempt = async {
                self.sharding
                    .broadcast_to_pod(&self.manager, topic_id, &pod, msg, Some(reply_id), &channel)
                    .await?;
                output.recv().await
            };
            let outcome = match self.send_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(ShardingError::SendTimeout {
                        entity_type: self.manager.recipient_type().name.clone(),
                        entity_id: topic_id.to_string(),
                    }),
                },
                None => attempt.await,
            };
            (pod, outcome)
        });
        futures::future::join_all(legs).await.into_iter().collect()
    }

    /// Broadcast fire-and-forget, ignoring per-pod results.
    pub async fn broadcast_discard(&self, topic_id: &str, msg: Msg) {
        let pods = self.sharding.pods_snapshot();
        let msg = &msg;
        let legs = pods.into_iter().map(|pod| async move {
            let (channel, output) = ReplyChannel::<()>::single();
            let result = self
                .sharding
                .broadcast_to_pod(&self.manager, topic_id, &pod, msg.clone(), None, &channel)
                .await;
            match result {
                Ok(()) => {
                    let _ = output.recv().await;
                }
                Err(error) => {
                    tracing::debug!(pod = %pod, %error, "broadcast leg failed");
                }
            }
        });
        futures::future::join_all(legs).await;
    }
}
