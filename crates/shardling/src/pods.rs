use crate::envelope::BinaryMessage;
use crate::error::ShardingError;
use crate::types::{PodAddress, ShardId};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashSet;

/// Client side of the inter-pod transport.
///
/// Implementations typically keep one connection per peer pod; the
/// get-or-connect pool in [`crate::connection_cache::ConnectionCache`] is
/// the helper for that (see [`crate::testing::LoopbackPods`] for an
/// in-process example).
///
/// Implementations (e.g. a gRPC client pool) must translate transport status
/// codes into the routing error taxonomy:
/// - resource-exhausted → [`ShardingError::EntityNotManagedByThisPod`]
/// - unavailable, or cancelled on a unary call → [`ShardingError::PodUnavailable`]
/// - cancelled on a streaming call → [`ShardingError::StreamCancelled`]
/// - anything else → [`ShardingError::Transport`]
#[async_trait]
pub trait Pods: Send + Sync {
    /// Tell a pod it now owns the given shards.
    async fn assign_shards(
        &self,
        pod: &PodAddress,
        shards: &HashSet<ShardId>,
    ) -> Result<(), ShardingError>;

    /// Tell a pod it no longer owns the given shards.
    async fn unassign_shards(
        &self,
        pod: &PodAddress,
        shards: &HashSet<ShardId>,
    ) -> Result<(), ShardingError>;

    /// Liveness check.
    async fn ping(&self, pod: &PodAddress) -> Result<(), ShardingError>;

    /// Unary: one message in, at most one reply out.
    async fn send_message(
        &self,
        pod: &PodAddress,
        message: BinaryMessage,
    ) -> Result<Option<Vec<u8>>, ShardingError>;

    /// Client-streaming: a sequence of messages for one entity, one reply out.
    async fn send_stream(
        &self,
        pod: &PodAddress,
        entity_id: &str,
        messages: BoxStream<'static, BinaryMessage>,
    ) -> Result<Option<Vec<u8>>, ShardingError>;

    /// Server-streaming: one message in, a stream of reply chunks out.
    async fn send_message_and_receive_stream(
        &self,
        pod: &PodAddress,
        message: BinaryMessage,
    ) -> Result<BoxStream<'static, Result<Vec<u8>, ShardingError>>, ShardingError>;

    /// Bidirectional: a sequence of messages in, a stream of reply chunks out.
    async fn send_stream_and_receive_stream(
        &self,
        pod: &PodAddress,
        entity_id: &str,
        messages: BoxStream<'static, BinaryMessage>,
    ) -> Result<BoxStream<'static, Result<Vec<u8>, ShardingError>>, ShardingError>;
}

/// Transport stub for single-pod deployments and tests: every remote call
/// reports the target pod as unavailable.
pub struct NoopPods;

#[async_trait]
impl Pods for NoopPods {
    async fn assign_shards(
        &self,
        _pod: &PodAddress,
        _shards: &HashSet<ShardId>,
    ) -> Result<(), ShardingError> {
        Ok(())
    }

    async fn unassign_shards(
        &self,
        _pod: &PodAddress,
        _shards: &HashSet<ShardId>,
    ) -> Result<(), ShardingError> {
        Ok(())
    }

    async fn ping(&self, _pod: &PodAddress) -> Result<(), ShardingError> {
        Ok(())
    }

    async fn send_message(
        &self,
        pod: &PodAddress,
        _message: BinaryMessage,
    ) -> Result<Option<Vec<u8>>, ShardingError> {
        Err(ShardingError::PodUnavailable {
            address: pod.clone(),
        })
    }

    async fn send_stream(
        &self,
        pod: &PodAddress,
        _entity_id: &str,
        _messages: BoxStream<'static, BinaryMessage>,
    ) -> Result<Option<Vec<u8>>, ShardingError> {
        Err(ShardingError::PodUnavailable {
            address: pod.clone(),
        })
    }

    async fn send_message_and_receive_stream(
        &self,
        pod: &PodAddress,
        _message: BinaryMessage,
    ) -> Result<BoxStream<'static, Result<Vec<u8>, ShardingError>>, ShardingError> {
        Err(ShardingError::PodUnavailable {
            address: pod.clone(),
        })
    }

    async fn send_stream_and_receive_stream(
        &self,
        pod: &PodAddress,
        _entity_id: &str,
        _messages: BoxStream<'static, BinaryMessage>,
    ) -> Result<BoxStream<'static, Result<Vec<u8>, ShardingError>>, ShardingError> {
        Err(ShardingError::PodUnavailable {
            address: pod.clone(),
        })
    }
}
