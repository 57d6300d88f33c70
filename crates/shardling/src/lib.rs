//! Per-pod core of a distributed actor-sharding runtime.
//!
//! A deployment consists of many pods; each entity (a string ID under a
//! named type) lives on exactly one pod, chosen by a deterministic shard
//! function. An external Shard Manager decides which pod owns which shard;
//! this crate consumes its assignments and provides:
//!
//! - per-type entity managers (on-demand creation, idle expiration, graceful
//!   termination),
//! - a sharding router (local-vs-remote dispatch, retry on transient routing
//!   errors, unhealthy-pod report dedup),
//! - reply channels unifying single and streaming responses across the local
//!   shortcut and the wire,
//! - cluster singletons pinned to the pod owning the sentinel shard,
//! - an assignment refresher reconciling the local table from Shard Manager
//!   snapshots and change-stream events.

pub mod broadcaster;
pub mod config;
pub mod connection_cache;
pub mod entity_manager;
pub mod envelope;
pub mod error;
pub mod hash;
pub mod message;
pub mod messenger;
pub mod metrics;
pub mod pods;
pub mod reply;
pub mod serialization;
pub mod shard_manager;
pub mod sharding;
pub mod singleton;
pub mod storage;
pub mod testing;
pub mod types;

mod assignments;

pub use broadcaster::Broadcaster;
pub use config::ShardingConfig;
pub use entity_manager::{
    EntityBehavior, EntityContext, EntityOptions, ShardFn, TerminateMessageFn, TerminationSignal,
};
pub use error::ShardingError;
pub use messenger::Messenger;
pub use reply::{Replier, ReplyChannel, ReplyId, SingleOutput, StreamOutput, StreamReplier};
pub use sharding::Sharding;
pub use types::{PodAddress, RecipientKind, RecipientType, ShardId};
