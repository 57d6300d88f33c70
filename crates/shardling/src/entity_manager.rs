//! Per-recipient-type entity lifecycle: on-demand creation, message
//! delivery, idle expiration, and graceful termination.

use crate::config::ShardingConfig;
use crate::error::ShardingError;
use crate::hash::shard_for_entity;
use crate::metrics::ShardingMetrics;
use crate::reply::{Replier, ReplyChannelOps, ReplyId, ReplyRegistry, StreamReplier};
use crate::serialization;
use crate::sharding::ShardScope;
use crate::types::{RecipientKind, RecipientType, ShardId};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Shard function for a recipient type. Both ends of a deployment must agree.
pub type ShardFn = Arc<dyn Fn(&str, u32) -> ShardId + Send + Sync>;

/// Handed to the terminate message so the entity can signal when its
/// graceful shutdown work is done.
#[derive(Debug, Clone)]
pub struct TerminationSignal(CancellationToken);

impl TerminationSignal {
    pub fn done(&self) {
        self.0.cancel();
    }
}

/// Terminate messages only travel within a pod, but user message enums
/// derive serde as a whole; a `#[serde(skip)]` field deserializes to this
/// detached default.
impl Default for TerminationSignal {
    fn default() -> Self {
        Self(CancellationToken::new())
    }
}

/// Builds the message enqueued to an entity when it is asked to terminate.
pub type TerminateMessageFn<Msg> = Arc<dyn Fn(TerminationSignal) -> Msg + Send + Sync>;

/// The long-running task driving one entity: receives the entity's ID and
/// its mailbox, and runs until the mailbox closes or the entity decides to
/// stop. Closures of the matching shape implement this directly.
pub trait EntityBehavior<Msg>: Send + Sync + 'static {
    fn run(
        &self,
        ctx: EntityContext,
        mailbox: mpsc::UnboundedReceiver<Msg>,
    ) -> BoxFuture<'static, Result<(), ShardingError>>;
}

impl<Msg, F> EntityBehavior<Msg> for F
where
    F: Fn(EntityContext, mpsc::UnboundedReceiver<Msg>) -> BoxFuture<'static, Result<(), ShardingError>>
        + Send
        + Sync
        + 'static,
{
    fn run(
        &self,
        ctx: EntityContext,
        mailbox: mpsc::UnboundedReceiver<Msg>,
    ) -> BoxFuture<'static, Result<(), ShardingError>> {
        (self)(ctx, mailbox)
    }
}

/// Capabilities handed to a running entity.
pub struct EntityContext {
    entity_id: String,
    replies: ReplyRegistry,
}

impl EntityContext {
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Answer a request through its [`Replier`].
    pub fn reply<Res>(&self, replier: &Replier<Res>, value: Res)
    where
        Res: Serialize + Send + Sync + 'static,
    {
        self.replies.reply_single(replier.id, value);
    }

    /// Answer a request with a stream of chunks through its [`StreamReplier`].
    pub async fn reply_stream<Res>(&self, replier: &StreamReplier<Res>, source: BoxStream<'static, Res>)
    where
        Res: Serialize + Send + Sync + 'static,
    {
        self.replies.reply_stream(replier.id, source).await;
    }
}

/// Registration options for a recipient type.
pub struct EntityOptions<Msg> {
    /// When set, termination enqueues this message and waits for its signal;
    /// otherwise termination closes the mailbox immediately.
    pub terminate_message: Option<TerminateMessageFn<Msg>>,
    /// Overrides the configured `entity_max_idle_time`.
    pub max_idle_time: Option<Duration>,
    /// Overrides the default shard function.
    pub shard_fn: Option<ShardFn>,
}

impl<Msg> Default for EntityOptions<Msg> {
    fn default() -> Self {
        Self {
            terminate_message: None,
            max_idle_time: None,
            shard_fn: None,
        }
    }
}

enum Slot<Msg> {
    Active {
        mailbox: mpsc::UnboundedSender<Msg>,
        expiration: CancellationToken,
        generation: u64,
    },
    Terminating {
        signal: CancellationToken,
        generation: u64,
    },
}

impl<Msg> Slot<Msg> {
    fn generation(&self) -> u64 {
        match self {
            Slot::Active { generation, .. } | Slot::Terminating { generation, .. } => *generation,
        }
    }
}

/// Owns every entity of one recipient type on this pod.
///
/// The entity map is updated under a mutex (creation spawns tasks); the
/// last-received map uses lock-free reads and writes. Slot transitions are
/// `absent → Active → Terminating → absent`, or `absent → Active → absent`
/// on hard shutdown; a generation tag per slot keeps the behavior task's
/// removal hook from clobbering a successor slot.
pub(crate) struct EntityManager<Msg> {
    recipient_type: RecipientType,
    behavior: Arc<dyn EntityBehavior<Msg>>,
    terminate_message: Option<TerminateMessageFn<Msg>>,
    entities: Arc<Mutex<HashMap<String, Slot<Msg>>>>,
    last_received: Arc<DashMap<String, i64>>,
    next_generation: AtomicU64,
    scope: Arc<dyn ShardScope>,
    replies: ReplyRegistry,
    config: Arc<ShardingConfig>,
    metrics: Arc<ShardingMetrics>,
    max_idle_time: Duration,
    shard_fn: ShardFn,
    self_ref: OnceLock<Weak<EntityManager<Msg>>>,
}

impl<Msg: Send + Sync + 'static> EntityManager<Msg> {
    pub fn new(
        recipient_type: RecipientType,
        behavior: impl EntityBehavior<Msg>,
        options: EntityOptions<Msg>,
        scope: Arc<dyn ShardScope>,
        replies: ReplyRegistry,
        config: Arc<ShardingConfig>,
        metrics: Arc<ShardingMetrics>,
    ) -> Arc<Self> {
        let max_idle_time = options.max_idle_time.unwrap_or(config.entity_max_idle_time);
        let shard_fn = options
            .shard_fn
            .unwrap_or_else(|| Arc::new(shard_for_entity));
        let this = Arc::new(Self {
            recipient_type,
            behavior: Arc::new(behavior),
            terminate_message: options.terminate_message,
            entities: Arc::new(Mutex::new(HashMap::new())),
            last_received: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            scope,
            replies,
            config,
            metrics,
            max_idle_time,
            shard_fn,
            self_ref: OnceLock::new(),
        });
        let _ = this.self_ref.set(Arc::downgrade(&this));
        this
    }

    pub fn recipient_type(&self) -> &RecipientType {
        &self.recipient_type
    }

    pub fn shard_of(&self, entity_id: &str) -> ShardId {
        (self.shard_fn)(entity_id, self.config.number_of_shards)
    }

    pub async fn active_count(&self) -> usize {
        self.entities.lock().await.len()
    }

    /// Deliver one message, registering the reply channel first when a reply
    /// is expected and completing it with `end` otherwise.
    ///
    /// The only error surfaced is `EntityNotManagedByThisPod` (stale routing
    /// or a draining pod); every other transient condition is retried.
    pub async fn send(
        &self,
        entity_id: &str,
        msg: Msg,
        reply_id: Option<ReplyId>,
        reply: &Arc<dyn ReplyChannelOps>,
    ) -> Result<(), ShardingError> {
        self.deliver(entity_id, msg, reply_id, reply).await?;
        if reply_id.is_none() {
            reply.end();
        }
        Ok(())
    }

    /// Deliver a sequence of messages to one entity, sharing a single reply.
    pub async fn send_stream_local(
        &self,
        entity_id: &str,
        mut messages: BoxStream<'static, Msg>,
        reply_id: Option<ReplyId>,
        reply: &Arc<dyn ReplyChannelOps>,
    ) -> Result<(), ShardingError> {
        loop {
            // Check routability before pulling, so an ownership race caught
            // here leaves the source intact for the router to retry.
            if self.recipient_type.kind == RecipientKind::Entity
                && !self.scope.is_entity_on_local_shards(self.shard_of(entity_id))
            {
                return Err(ShardingError::entity_not_managed(entity_id));
            }
            let Some(msg) = messages.next().await else {
                break;
            };
            self.deliver(entity_id, msg, reply_id, reply).await?;
        }
        if reply_id.is_none() {
            reply.end();
        }
        Ok(())
    }

    async fn deliver(
        &self,
        entity_id: &str,
        msg: Msg,
        reply_id: Option<ReplyId>,
        reply: &Arc<dyn ReplyChannelOps>,
    ) -> Result<(), ShardingError> {
        let mut msg = Some(msg);
        loop {
            if self.recipient_type.kind == RecipientKind::Entity
                && !self.scope.is_entity_on_local_shards(self.shard_of(entity_id))
            {
                return Err(ShardingError::entity_not_managed(entity_id));
            }

            // The enqueue happens under the entity-map lock: it never blocks
            // (the mailbox is unbounded), and holding the lock keeps
            // termination from closing the mailbox between lookup and send.
            let sent = {
                let mut entities = self.entities.lock().await;
                let mailbox = match entities.get(entity_id) {
                    Some(Slot::Terminating { .. }) => None,
                    Some(Slot::Active { mailbox, .. }) => Some(mailbox.clone()),
                    None => Some(self.create_entity(&mut entities, entity_id)?),
                };
                match mailbox {
                    None => false,
                    Some(mailbox) => {
                        self.last_received
                            .insert(entity_id.to_string(), now_millis());
                        if let Some(id) = reply_id {
                            self.replies.register(id, Arc::clone(reply));
                        }
                        let message = msg.take().expect("message present until enqueued");
                        match mailbox.send(message) {
                            Ok(()) => true,
                            Err(mpsc::error::SendError(returned)) => {
                                // Behavior exited on its own; its removal hook
                                // is waiting on this lock. Back off and retry
                                // against a fresh slot.
                                msg = Some(returned);
                                false
                            }
                        }
                    }
                }
            };
            if sent {
                return Ok(());
            }
            tokio::time::sleep(self.config.send_retry_interval).await;
        }
    }

    /// Install a fresh entity. Runs under the entity-map lock so concurrent
    /// sends cannot double-spawn.
    fn create_entity(
        &self,
        entities: &mut HashMap<String, Slot<Msg>>,
        entity_id: &str,
    ) -> Result<mpsc::UnboundedSender<Msg>, ShardingError> {
        if self.scope.is_shutting_down() {
            return Err(ShardingError::entity_not_managed(entity_id));
        }

        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let expiration = CancellationToken::new();

        self.metrics
            .entities
            .with_label_values(&[self.recipient_type.as_ref()])
            .inc();
        self.last_received
            .insert(entity_id.to_string(), now_millis());

        let ctx = EntityContext {
            entity_id: entity_id.to_string(),
            replies: self.replies.clone(),
        };
        let behavior_fut = self.behavior.run(ctx, mailbox_rx);

        // Behavior task. The hook on exit tears the slot down whichever way
        // the behavior ends: finished, failed, or drained after termination.
        let entities_map = Arc::clone(&self.entities);
        let last_received = Arc::clone(&self.last_received);
        let metrics = Arc::clone(&self.metrics);
        let type_name = self.recipient_type.name.clone();
        let expiration_for_hook = expiration.clone();
        let id = entity_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = behavior_fut.await {
                tracing::error!(
                    entity_type = %type_name,
                    entity_id = %id,
                    %error,
                    "entity behavior failed"
                );
            }
            let removed = {
                let mut entities = entities_map.lock().await;
                match entities.get(&id) {
                    Some(slot) if slot.generation() == generation => entities.remove(&id),
                    _ => None,
                }
            };
            if let Some(slot) = removed {
                if let Slot::Terminating { signal, .. } = &slot {
                    signal.cancel();
                }
                last_received.remove(&id);
                metrics
                    .entities
                    .with_label_values(&[type_name.as_str()])
                    .dec();
                expiration_for_hook.cancel();
            }
        });

        // Idle expiration task: a sleep loop, re-armed from last-received.
        let weak = self
            .self_ref
            .get()
            .cloned()
            .expect("self_ref initialized at construction");
        let last_received = Arc::clone(&self.last_received);
        let max_idle = self.max_idle_time;
        let expire_token = expiration.clone();
        let id = entity_id.to_string();
        tokio::spawn(async move {
            let mut sleep_for = max_idle;
            loop {
                tokio::select! {
                    _ = expire_token.cancelled() => return,
                    _ = tokio::time::sleep(sleep_for) => {}
                }
                let last = last_received
                    .get(&id)
                    .map(|entry| *entry.value())
                    .unwrap_or_else(now_millis);
                let elapsed = now_millis().saturating_sub(last);
                let max_idle_ms = max_idle.as_millis() as i64;
                if elapsed >= max_idle_ms {
                    // Detached, so this task is not unwound by the
                    // termination it triggers.
                    if let Some(manager) = weak.upgrade() {
                        tokio::spawn(async move { manager.terminate_entity(&id).await });
                    }
                    return;
                }
                sleep_for = Duration::from_millis((max_idle_ms - elapsed) as u64);
            }
        });

        entities.insert(
            entity_id.to_string(),
            Slot::Active {
                mailbox: mailbox_tx.clone(),
                expiration,
                generation,
            },
        );
        Ok(mailbox_tx)
    }

    /// Ask one entity to terminate. Infallible; a no-op when the entity is
    /// absent or already terminating.
    pub async fn terminate_entity(&self, entity_id: &str) {
        let _ = self.begin_termination(entity_id).await;
    }

    /// Start termination and return a token that completes when the entity's
    /// graceful shutdown is done. `None` when the entity was absent or was
    /// shut down immediately.
    async fn begin_termination(&self, entity_id: &str) -> Option<CancellationToken> {
        let mut entities = self.entities.lock().await;
        match entities.get(entity_id) {
            None => None,
            Some(Slot::Terminating { signal, .. }) => Some(signal.clone()),
            Some(Slot::Active { .. }) => {
                let Some(Slot::Active {
                    mailbox,
                    expiration,
                    generation,
                }) = entities.remove(entity_id)
                else {
                    return None;
                };
                expiration.cancel();
                match &self.terminate_message {
                    Some(factory) => {
                        let signal = CancellationToken::new();
                        let message = factory(TerminationSignal(signal.clone()));
                        // Best-effort: a concurrently closed mailbox means the
                        // behavior already exited and the hook will finish up.
                        let _ = mailbox.send(message);
                        entities.insert(
                            entity_id.to_string(),
                            Slot::Terminating {
                                signal: signal.clone(),
                                generation,
                            },
                        );
                        Some(signal)
                    }
                    None => {
                        // Hard shutdown: close the mailbox and drop the slot.
                        drop(mailbox);
                        self.last_received.remove(entity_id);
                        self.metrics
                            .entities
                            .with_label_values(&[self.recipient_type.as_ref()])
                            .dec();
                        None
                    }
                }
            }
        }
    }

    pub async fn terminate_entities_on_shards(&self, shards: &HashSet<ShardId>) {
        let ids: Vec<String> = {
            let entities = self.entities.lock().await;
            entities
                .keys()
                .filter(|id| shards.contains(&self.shard_of(id)))
                .cloned()
                .collect()
        };
        self.terminate_and_wait(ids).await;
    }

    pub async fn terminate_all_entities(&self) {
        let ids: Vec<String> = { self.entities.lock().await.keys().cloned().collect() };
        self.terminate_and_wait(ids).await;
    }

    /// Terminate the given entities and wait for their signals, bounded by
    /// `entity_termination_timeout`. Entities still running at the deadline
    /// are abandoned; their tasks finish independently.
    async fn terminate_and_wait(&self, ids: Vec<String>) {
        let mut signals = Vec::new();
        for id in &ids {
            if let Some(signal) = self.begin_termination(id).await {
                signals.push(signal);
            }
        }
        if signals.is_empty() {
            return;
        }
        let all_done = futures::future::join_all(signals.iter().map(|signal| signal.cancelled()));
        if tokio::time::timeout(self.config.entity_termination_timeout, all_done)
            .await
            .is_err()
        {
            let abandoned = signals.iter().filter(|s| !s.is_cancelled()).count();
            tracing::warn!(
                entity_type = %self.recipient_type,
                abandoned,
                "timed out waiting for entity termination; abandoning remaining entities"
            );
        }
    }
}

/// Type-erased manager handle held by the router, one per registered
/// recipient type. Binary entry points decode with the type's message codec.
#[async_trait]
pub(crate) trait RecipientManager: Send + Sync {
    fn recipient_type(&self) -> &RecipientType;

    fn shard_of(&self, entity_id: &str) -> ShardId;

    async fn send_binary(
        &self,
        entity_id: &str,
        body: Vec<u8>,
        reply_id: Option<ReplyId>,
        reply: Arc<dyn ReplyChannelOps>,
    ) -> Result<(), ShardingError>;

    async fn send_binary_stream(
        &self,
        entity_id: &str,
        bodies: BoxStream<'static, Vec<u8>>,
        reply_id: Option<ReplyId>,
        reply: Arc<dyn ReplyChannelOps>,
    ) -> Result<(), ShardingError>;

    async fn terminate_entities_on_shards(&self, shards: &HashSet<ShardId>);

    async fn terminate_all_entities(&self);
}

#[async_trait]
impl<Msg> RecipientManager for EntityManager<Msg>
where
    Msg: DeserializeOwned + Send + Sync + 'static,
{
    fn recipient_type(&self) -> &RecipientType {
        &self.recipient_type
    }

    fn shard_of(&self, entity_id: &str) -> ShardId {
        EntityManager::shard_of(self, entity_id)
    }

    async fn send_binary(
        &self,
        entity_id: &str,
        body: Vec<u8>,
        reply_id: Option<ReplyId>,
        reply: Arc<dyn ReplyChannelOps>,
    ) -> Result<(), ShardingError> {
        let msg: Msg = serialization::decode(&body)?;
        self.send(entity_id, msg, reply_id, &reply).await
    }

    async fn send_binary_stream(
        &self,
        entity_id: &str,
        mut bodies: BoxStream<'static, Vec<u8>>,
        reply_id: Option<ReplyId>,
        reply: Arc<dyn ReplyChannelOps>,
    ) -> Result<(), ShardingError> {
        while let Some(body) = bodies.next().await {
            let msg: Msg = serialization::decode_chunk(&body)?;
            self.deliver(entity_id, msg, reply_id, &reply).await?;
        }
        if reply_id.is_none() {
            reply.end();
        }
        Ok(())
    }

    async fn terminate_entities_on_shards(&self, shards: &HashSet<ShardId>) {
        EntityManager::terminate_entities_on_shards(self, shards).await;
    }

    async fn terminate_all_entities(&self) {
        EntityManager::terminate_all_entities(self).await;
    }
}

/// Helper so the router can recover the typed manager behind a
/// [`RecipientManager`]; the cast lives here to stay next to the erasure.
pub(crate) fn downcast_manager<Msg: Send + Sync + 'static>(
    any: Arc<dyn Any + Send + Sync>,
) -> Option<Arc<EntityManager<Msg>>> {
    any.downcast::<EntityManager<Msg>>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ReplyChannel;
    use futures::FutureExt;
    use serde::Deserialize;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum CounterMsg {
        Add { amount: u64, replier: Replier<u64> },
        Stop { signal_done: bool },
    }

    struct StaticScope {
        local: bool,
        shutting_down: AtomicBool,
    }

    impl ShardScope for StaticScope {
        fn is_entity_on_local_shards(&self, _shard: ShardId) -> bool {
            self.local
        }

        fn is_shutting_down(&self) -> bool {
            self.shutting_down.load(Ordering::Acquire)
        }
    }

    fn scope(local: bool) -> Arc<StaticScope> {
        Arc::new(StaticScope {
            local,
            shutting_down: AtomicBool::new(false),
        })
    }

    fn counter_behavior() -> impl EntityBehavior<CounterMsg> {
        |ctx: EntityContext, mut mailbox: mpsc::UnboundedReceiver<CounterMsg>| {
            async move {
                let mut total = 0u64;
                while let Some(msg) = mailbox.recv().await {
                    match msg {
                        CounterMsg::Add { amount, replier } => {
                            total += amount;
                            ctx.reply(&replier, total);
                        }
                        CounterMsg::Stop { .. } => break,
                    }
                }
                Ok(())
            }
            .boxed()
        }
    }

    fn manager_with(
        options: EntityOptions<CounterMsg>,
        config: ShardingConfig,
    ) -> (Arc<EntityManager<CounterMsg>>, ReplyRegistry) {
        let replies = ReplyRegistry::new();
        let manager = EntityManager::new(
            RecipientType::entity("Counter"),
            counter_behavior(),
            options,
            scope(true),
            replies.clone(),
            Arc::new(config),
            Arc::new(ShardingMetrics::unregistered()),
        );
        (manager, replies)
    }

    async fn send_add(
        manager: &Arc<EntityManager<CounterMsg>>,
        entity_id: &str,
        amount: u64,
    ) -> u64 {
        let reply_id = ReplyId::random();
        let (channel, output) = ReplyChannel::<u64>::single();
        let erased: Arc<dyn ReplyChannelOps> = Arc::new(channel);
        manager
            .send(
                entity_id,
                CounterMsg::Add {
                    amount,
                    replier: Replier::new(reply_id),
                },
                Some(reply_id),
                &erased,
            )
            .await
            .unwrap();
        output.recv().await.unwrap().expect("counter should reply")
    }

    #[tokio::test]
    async fn send_creates_entity_and_replies() {
        let (manager, _replies) = manager_with(EntityOptions::default(), ShardingConfig::default());
        assert_eq!(send_add(&manager, "c-1", 2).await, 2);
        assert_eq!(send_add(&manager, "c-1", 3).await, 5);
        assert_eq!(manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn entities_are_isolated_by_id() {
        let (manager, _replies) = manager_with(EntityOptions::default(), ShardingConfig::default());
        assert_eq!(send_add(&manager, "a", 1).await, 1);
        assert_eq!(send_add(&manager, "b", 10).await, 10);
        assert_eq!(manager.active_count().await, 2);
    }

    #[tokio::test]
    async fn send_fails_when_shard_not_local() {
        let replies = ReplyRegistry::new();
        let manager = EntityManager::new(
            RecipientType::entity("Counter"),
            counter_behavior(),
            EntityOptions::default(),
            scope(false),
            replies,
            Arc::new(ShardingConfig::default()),
            Arc::new(ShardingMetrics::unregistered()),
        );
        let (channel, _output) = ReplyChannel::<u64>::single();
        let erased: Arc<dyn ReplyChannelOps> = Arc::new(channel);
        let err = manager
            .send(
                "c-1",
                CounterMsg::Stop { signal_done: false },
                None,
                &erased,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardingError::EntityNotManagedByThisPod { .. }
        ));
    }

    #[tokio::test]
    async fn send_fails_while_shutting_down() {
        let replies = ReplyRegistry::new();
        let scope = scope(true);
        let manager = EntityManager::new(
            RecipientType::entity("Counter"),
            counter_behavior(),
            EntityOptions::default(),
            scope.clone(),
            replies,
            Arc::new(ShardingConfig::default()),
            Arc::new(ShardingMetrics::unregistered()),
        );
        scope.shutting_down.store(true, Ordering::Release);
        let (channel, _output) = ReplyChannel::<u64>::single();
        let erased: Arc<dyn ReplyChannelOps> = Arc::new(channel);
        let err = manager
            .send(
                "c-1",
                CounterMsg::Stop { signal_done: false },
                None,
                &erased,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ShardingError::EntityNotManagedByThisPod { .. }
        ));
    }

    #[tokio::test]
    async fn topic_sends_skip_shard_check() {
        let replies = ReplyRegistry::new();
        let manager = EntityManager::new(
            RecipientType::topic("Counter"),
            counter_behavior(),
            EntityOptions::default(),
            scope(false),
            replies,
            Arc::new(ShardingConfig::default()),
            Arc::new(ShardingMetrics::unregistered()),
        );
        assert_eq!(send_add(&manager, "topic-1", 4).await, 4);
    }

    #[tokio::test]
    async fn hard_termination_removes_slot_immediately() {
        let (manager, _replies) = manager_with(EntityOptions::default(), ShardingConfig::default());
        send_add(&manager, "c-1", 1).await;
        manager.terminate_entity("c-1").await;
        assert_eq!(manager.active_count().await, 0);
    }

    #[tokio::test]
    async fn terminated_entity_is_recreated_on_next_send() {
        let (manager, _replies) = manager_with(EntityOptions::default(), ShardingConfig::default());
        assert_eq!(send_add(&manager, "c-1", 5).await, 5);
        manager.terminate_entity("c-1").await;
        // Fresh mailbox, fresh state.
        assert_eq!(send_add(&manager, "c-1", 1).await, 1);
    }

    #[tokio::test]
    async fn graceful_termination_waits_for_signal() {
        let options = EntityOptions {
            terminate_message: Some(Arc::new(|signal: TerminationSignal| {
                signal.done();
                CounterMsg::Stop { signal_done: true }
            })),
            ..Default::default()
        };
        let (manager, _replies) = manager_with(options, ShardingConfig::default());
        send_add(&manager, "c-1", 1).await;

        let started = std::time::Instant::now();
        manager.terminate_all_entities().await;
        assert!(started.elapsed() < Duration::from_secs(1));

        // The behavior drains the stop message and the hook removes the slot.
        tokio::time::timeout(Duration::from_secs(1), async {
            while manager.active_count().await != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("slot should be removed after graceful termination");
    }

    #[tokio::test]
    async fn slow_entities_are_abandoned_at_the_termination_timeout() {
        // The terminate message never signals, so the wait must hit the bound.
        let options = EntityOptions {
            terminate_message: Some(Arc::new(|_signal: TerminationSignal| CounterMsg::Stop {
                signal_done: false,
            })),
            ..Default::default()
        };
        let config = ShardingConfig {
            entity_termination_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (manager, _replies) = manager_with(options, config);
        for i in 0..5 {
            send_add(&manager, &format!("c-{i}"), 1).await;
        }

        let started = std::time::Instant::now();
        manager.terminate_all_entities().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(90), "returned too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(1), "did not respect the bound: {elapsed:?}");
    }

    #[tokio::test]
    async fn idle_entity_expires_and_can_be_recreated() {
        let options = EntityOptions {
            max_idle_time: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let (manager, _replies) = manager_with(options, ShardingConfig::default());
        assert_eq!(send_add(&manager, "c-1", 7).await, 7);

        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.active_count().await != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("idle entity should expire");

        // A later send builds a new mailbox with fresh state.
        assert_eq!(send_add(&manager, "c-1", 1).await, 1);
    }

    #[tokio::test]
    async fn activity_postpones_expiration() {
        let options = EntityOptions {
            max_idle_time: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        let (manager, _replies) = manager_with(options, ShardingConfig::default());
        send_add(&manager, "c-1", 1).await;
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            send_add(&manager, "c-1", 1).await;
        }
        // Recent traffic: still alive.
        assert_eq!(manager.active_count().await, 1);
    }

    #[tokio::test]
    async fn terminate_entities_on_shards_only_touches_matching_shards() {
        let (manager, _replies) = manager_with(EntityOptions::default(), ShardingConfig::default());
        send_add(&manager, "a", 1).await;
        send_add(&manager, "b", 1).await;

        let shard_a = manager.shard_of("a");
        let shard_b = manager.shard_of("b");
        manager
            .terminate_entities_on_shards(&HashSet::from([shard_a]))
            .await;

        let entities = manager.entities.lock().await;
        assert!(!entities.contains_key("a"));
        assert_eq!(entities.contains_key("b"), shard_b != shard_a);
    }

    #[tokio::test]
    async fn binary_send_decodes_and_replies_bytes() {
        let (manager, _replies) = manager_with(EntityOptions::default(), ShardingConfig::default());
        let reply_id = ReplyId::random();
        let msg = CounterMsg::Add {
            amount: 9,
            replier: Replier::new(reply_id),
        };
        let body = serialization::encode(&msg).unwrap();

        let (channel, output) = ReplyChannel::<Vec<u8>>::single();
        let erased: Arc<dyn ReplyChannelOps> = Arc::new(channel);
        RecipientManager::send_binary(manager.as_ref(), "c-1", body, Some(reply_id), erased)
            .await
            .unwrap();

        let bytes = output.recv().await.unwrap().expect("reply bytes");
        let total: u64 = serialization::decode(&bytes).unwrap();
        assert_eq!(total, 9);
    }
}
