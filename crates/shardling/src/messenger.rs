//! Typed point-to-point client for one entity type.

use crate::entity_manager::EntityManager;
use crate::error::ShardingError;
use crate::message::SendChannel;
use crate::reply::{Replier, ReplyChannel, ReplyId, StreamOutput, StreamReplier};
use crate::sharding::Sharding;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Sends messages to entities of one type, resolving the owning pod per
/// send. Obtained from [`Sharding::messenger`].
pub struct Messenger<Msg> {
    sharding: Arc<Sharding>,
    manager: Arc<EntityManager<Msg>>,
    send_timeout: Option<Duration>,
}

impl<Msg> std::fmt::Debug for Messenger<Msg> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

impl<Msg> Messenger<Msg>
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

    /// Override the configured send timeout for this messenger.
    pub fn with_send_timeout(mut self, send_timeout: Option<Duration>) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    fn timeout_error(&self, entity_id: &str) -> ShardingError {
        ShardingError::SendTimeout {
            entity_type: self.manager.recipient_type().name.clone(),
            entity_id: entity_id.to_string(),
        }
    }

    /// Send a request and await its single reply.
    ///
    /// `make` receives the [`Replier`] to embed in the message. On timeout
    /// the in-flight send is dropped, which stops its retry loop, and
    /// [`ShardingError::SendTimeout`] is returned.
    pub async fn send<Res>(
        &self,
        entity_id: &str,
        make: impl FnOnce(Replier<Res>) -> Msg,
    ) -> Result<Res, ShardingError>
    where
        Res: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let reply_id = ReplyId::random();
        let (channel, output) = ReplyChannel::<Res>::single();
        let msg = make(Replier::new(reply_id));
        let attempt = async {
            self.sharding
                .route_send(
                    &self.manager,
                    entity_id,
                    SendChannel::Single(msg),
                    Some(reply_id),
                    &channel,
                )
                .await;
            output.recv().await
        };
        let outcome = match self.send_timeout {
            Some(timeout) => tokio::time::timeout(timeout, attempt)
                .await
                .map_err(|_| self.timeout_error(entity_id))?,
            None => attempt.await,
        };
        outcome?.ok_or_else(|| ShardingError::NoReplyReceived {
            entity_type: self.manager.recipient_type().name.clone(),
            entity_id: entity_id.to_string(),
        })
    }

    /// Fire-and-forget send, wrapped in the configured timeout when set.
    pub async fn send_discard(&self, entity_id: &str, msg: Msg) -> Result<(), ShardingError> {
        let (channel, output) = ReplyChannel::<()>::single();
        let attempt = async {
            self.sharding
                .route_send(
                    &self.manager,
                    entity_id,
                    SendChannel::Single(msg),
                    None,
                    &channel,
                )
                .await;
            output.recv().await
        };
        let outcome = match self.send_timeout {
            Some(timeout) => tokio::time::timeout(timeout, attempt)
                .await
                .map_err(|_| self.timeout_error(entity_id))?,
            None => attempt.await,
        };
        outcome.map(|_| ())
    }

    /// Send a request whose reply is a stream of chunks.
    ///
    /// The routing runs detached so the stream can be consumed immediately;
    /// routing failures surface as the stream's terminal error.
    pub fn send_stream<Res>(
        &self,
        entity_id: &str,
        make: impl FnOnce(StreamReplier<Res>) -> Msg,
    ) -> StreamOutput<Res>
    where
        Res: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let reply_id = ReplyId::random();
        let (channel, output) = ReplyChannel::<Res>::stream();
        let msg = make(StreamReplier::new(reply_id));
        let sharding = Arc::clone(&self.sharding);
        let manager = Arc::clone(&self.manager);
        let entity_id = entity_id.to_string();
        tokio::spawn(async move {
            sharding
                .route_send(
                    &manager,
                    &entity_id,
                    SendChannel::Single(msg),
                    Some(reply_id),
                    &channel,
                )
                .await;
        });
        output
    }

    /// Send a sequence of messages to one entity, fire-and-forget.
    pub async fn send_all_discard(
        &self,
        entity_id: &str,
        messages: BoxStream<'static, Msg>,
    ) -> Result<(), ShardingError> {
        let (channel, output) = ReplyChannel::<()>::single();
        self.sharding
            .route_send(
                &self.manager,
                entity_id,
                SendChannel::Stream(messages),
                None,
                &channel,
            )
            .await;
        output.recv().await.map(|_| ())
    }

    /// Send a sequence of messages and receive a stream of reply chunks.
    ///
    /// `make` receives the [`StreamReplier`] and builds the outbound message
    /// sequence.
    pub fn send_all_and_receive_stream<Res>(
        &self,
        entity_id: &str,
        make: impl FnOnce(StreamReplier<Res>) -> BoxStream<'static, Msg>,
    ) -> StreamOutput<Res>
    where
        Res: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let reply_id = ReplyId::random();
        let (channel, output) = ReplyChannel::<Res>::stream();
        let messages = make(StreamReplier::new(reply_id));
        let sharding = Arc::clone(&self.sharding);
        let manager = Arc::clone(&self.manager);
        let entity_id = entity_id.to_string();
        tokio::spawn(async move {
            sharding
                .route_send(
                    &manager,
                    &entity_id,
                    SendChannel::Stream(messages),
                    Some(reply_id),
                    &channel,
                )
                .await;
        });
        output
    }
}
