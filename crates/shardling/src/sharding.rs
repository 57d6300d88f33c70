//! The per-pod sharding orchestrator: owns the assignment table, routes
//! sends to the local entity manager or a peer pod, drives the assignment
//! refresher, and reconciles singletons against sentinel-shard ownership.

use crate::assignments::AssignmentTable;
use crate::broadcaster::Broadcaster;
use crate::config::ShardingConfig;
use crate::entity_manager::{
    downcast_manager, now_millis, EntityBehavior, EntityManager, EntityOptions, RecipientManager,
};
use crate::envelope::BinaryMessage;
use crate::error::ShardingError;
use crate::hash::shard_for_entity;
use crate::message::{SendChannel, StreamSource};
use crate::messenger::Messenger;
use crate::metrics::ShardingMetrics;
use crate::pods::Pods;
use crate::reply::{ReplyChannel, ReplyChannelOps, ReplyId, ReplyRegistry, StreamOutput};
use crate::serialization;
use crate::shard_manager::ShardManagerClient;
use crate::singleton::{SingletonRegistry, SingletonRun};
use crate::storage::AssignmentStorage;
use crate::types::{PodAddress, RecipientKind, RecipientType, ShardId};
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// The sentinel shard whose owner runs every registered singleton.
const SINGLETON_SHARD: ShardId = ShardId(1);

/// Narrow view of the router handed to entity managers, avoiding an owning
/// cycle between the two.
pub(crate) trait ShardScope: Send + Sync + 'static {
    fn is_entity_on_local_shards(&self, shard: ShardId) -> bool;
    fn is_shutting_down(&self) -> bool;
}

struct ScopeHandle {
    sharding: Weak<Sharding>,
}

impl ShardScope for ScopeHandle {
    fn is_entity_on_local_shards(&self, shard: ShardId) -> bool {
        match self.sharding.upgrade() {
            Some(sharding) => sharding.assignments.is_owner(shard, &sharding.self_address),
            None => false,
        }
    }

    fn is_shutting_down(&self) -> bool {
        match self.sharding.upgrade() {
            Some(sharding) => sharding.is_shutting_down(),
            None => true,
        }
    }
}

/// One registered recipient type: the erased manager used by the binary
/// entry points, plus an `Any` handle so typed clients can recover the
/// concrete manager.
struct RegisteredRecipient {
    erased: Arc<dyn RecipientManager>,
    any: Arc<dyn Any + Send + Sync>,
}

/// Latch signalling that the first assignment snapshot has been installed.
struct ReadyLatch {
    tx: watch::Sender<bool>,
}

impl ReadyLatch {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    fn open(&self) {
        self.tx.send_replace(true);
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|opened| *opened).await;
    }
}

pub struct Sharding {
    config: Arc<ShardingConfig>,
    self_address: PodAddress,
    pods: Arc<dyn Pods>,
    shard_manager: Arc<dyn ShardManagerClient>,
    storage: Arc<dyn AssignmentStorage>,
    metrics: Arc<ShardingMetrics>,
    assignments: AssignmentTable,
    managers: DashMap<String, RegisteredRecipient>,
    replies: ReplyRegistry,
    singletons: SingletonRegistry,
    shutting_down: AtomicBool,
    /// Epoch millis of the last unhealthy-pod report; CAS-updated to dedup.
    last_unhealthy_report_ms: AtomicI64,
    assignments_ready: ReadyLatch,
    cancel: CancellationToken,
    background_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    self_ref: OnceLock<Weak<Sharding>>,
}

impl Sharding {
    pub fn new(
        config: ShardingConfig,
        pods: Arc<dyn Pods>,
        shard_manager: Arc<dyn ShardManagerClient>,
        storage: Arc<dyn AssignmentStorage>,
        metrics: Arc<ShardingMetrics>,
    ) -> Result<Arc<Self>, ShardingError> {
        config.validate()?;
        let self_address = config.self_address();
        let this = Arc::new(Self {
            config: Arc::new(config),
            self_address,
            pods,
            shard_manager,
            storage,
            singletons: SingletonRegistry::new(Arc::clone(&metrics)),
            metrics,
            assignments: AssignmentTable::new(),
            managers: DashMap::new(),
            replies: ReplyRegistry::new(),
            shutting_down: AtomicBool::new(false),
            last_unhealthy_report_ms: AtomicI64::new(0),
            assignments_ready: ReadyLatch::new(),
            cancel: CancellationToken::new(),
            background_tasks: parking_lot::Mutex::new(Vec::new()),
            self_ref: OnceLock::new(),
        });
        let _ = this.self_ref.set(Arc::downgrade(&this));
        Ok(this)
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub fn self_address(&self) -> &PodAddress {
        &self.self_address
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Shard of an entity under the given recipient type, honoring the
    /// type's shard-function override when one was registered.
    pub fn get_shard_id(&self, entity_type: &str, entity_id: &str) -> ShardId {
        match self.managers.get(entity_type) {
            Some(entry) => entry.value().erased.shard_of(entity_id),
            None => shard_for_entity(entity_id, self.config.number_of_shards),
        }
    }

    pub fn is_entity_on_local_shards(&self, shard: ShardId) -> bool {
        self.assignments.is_owner(shard, &self.self_address)
    }

    /// Pods currently holding at least one shard.
    pub fn pods_snapshot(&self) -> HashSet<PodAddress> {
        self.assignments.pods()
    }

    /// Number of reply channels currently registered. Mostly for tests.
    pub fn registered_replies(&self) -> usize {
        self.replies.len()
    }

    fn strong_self(&self) -> Arc<Sharding> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("self_ref initialized at construction")
    }

    // -----------------------------------------------------------------------
    // Registration lifecycle
    // -----------------------------------------------------------------------

    /// Announce this pod to the Shard Manager and start the assignment
    /// refresher. Returns once the first snapshot is installed, so sends
    /// issued afterwards see a populated table.
    pub async fn register(self: &Arc<Self>) -> Result<(), ShardingError> {
        tracing::info!(pod = %self.self_address, "registering pod with the shard manager");
        self.shard_manager.register(&self.self_address).await?;
        self.spawn_refresher();
        self.assignments_ready.wait().await;
        Ok(())
    }

    /// Drain this pod: tell the Shard Manager first (best-effort), then stop
    /// singletons, terminate local entities, and end background tasks.
    pub async fn unregister(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(pod = %self.self_address, "unregistering pod; draining local entities");
        if let Err(error) = self.shard_manager.unregister(&self.self_address).await {
            tracing::warn!(%error, "failed to unregister from the shard manager; draining anyway");
        }
        self.singletons.stop_all().await;
        let managers: Vec<Arc<dyn RecipientManager>> = self
            .managers
            .iter()
            .map(|entry| Arc::clone(&entry.value().erased))
            .collect();
        for manager in managers {
            manager.terminate_all_entities().await;
        }
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.background_tasks.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Recipient registration & clients
    // -----------------------------------------------------------------------

    /// Register an entity type. Messages route to exactly one pod.
    pub fn register_entity<Msg>(
        &self,
        name: impl Into<String>,
        behavior: impl EntityBehavior<Msg>,
        options: EntityOptions<Msg>,
    ) -> Result<(), ShardingError>
    where
        Msg: DeserializeOwned + Send + Sync + 'static,
    {
        self.register_recipient(RecipientType::entity(name), behavior, options)
    }

    /// Register a topic type. Messages fan out to all pods holding shards.
    pub fn register_topic<Msg>(
        &self,
        name: impl Into<String>,
        behavior: impl EntityBehavior<Msg>,
        options: EntityOptions<Msg>,
    ) -> Result<(), ShardingError>
    where
        Msg: DeserializeOwned + Send + Sync + 'static,
    {
        self.register_recipient(RecipientType::topic(name), behavior, options)
    }

    fn register_recipient<Msg>(
        &self,
        recipient_type: RecipientType,
        behavior: impl EntityBehavior<Msg>,
        options: EntityOptions<Msg>,
    ) -> Result<(), ShardingError>
    where
        Msg: DeserializeOwned + Send + Sync + 'static,
    {
        let name = recipient_type.name.clone();
        if self.managers.contains_key(&name) {
            return Err(ShardingError::InvalidConfig {
                reason: format!("recipient type {name} is already registered"),
            });
        }
        let scope: Arc<dyn ShardScope> = Arc::new(ScopeHandle {
            sharding: self
                .self_ref
                .get()
                .cloned()
                .expect("self_ref initialized at construction"),
        });
        let manager = EntityManager::new(
            recipient_type,
            behavior,
            options,
            scope,
            self.replies.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.metrics),
        );
        let any: Arc<dyn Any + Send + Sync> = Arc::clone(&manager) as Arc<dyn Any + Send + Sync>;
        let erased: Arc<dyn RecipientManager> = manager;
        self.managers
            .insert(name, RegisteredRecipient { erased, any });
        Ok(())
    }

    /// Typed point-to-point client for a registered entity type.
    pub fn messenger<Msg>(&self, entity_type: &str) -> Result<Messenger<Msg>, ShardingError>
    where
        Msg: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let manager = self.typed_manager::<Msg>(entity_type)?;
        if manager.recipient_type().kind != RecipientKind::Entity {
            return Err(ShardingError::InvalidConfig {
                reason: format!("recipient type {entity_type} is a topic; use broadcaster()"),
            });
        }
        Ok(Messenger::new(
            self.strong_self(),
            manager,
            self.config.send_timeout,
        ))
    }

    /// Typed one-to-all-pods client for a registered topic type.
    pub fn broadcaster<Msg>(&self, topic_type: &str) -> Result<Broadcaster<Msg>, ShardingError>
    where
        Msg: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let manager = self.typed_manager::<Msg>(topic_type)?;
        if manager.recipient_type().kind != RecipientKind::Topic {
            return Err(ShardingError::InvalidConfig {
                reason: format!("recipient type {topic_type} is an entity type; use messenger()"),
            });
        }
        Ok(Broadcaster::new(
            self.strong_self(),
            manager,
            self.config.send_timeout,
        ))
    }

    fn typed_manager<Msg>(&self, name: &str) -> Result<Arc<EntityManager<Msg>>, ShardingError>
    where
        Msg: Send + Sync + 'static,
    {
        let entry = self
            .managers
            .get(name)
            .ok_or_else(|| ShardingError::UnknownRecipientType {
                name: name.to_string(),
            })?;
        downcast_manager::<Msg>(Arc::clone(&entry.value().any)).ok_or_else(|| {
            ShardingError::InvalidConfig {
                reason: format!("recipient type {name} was registered with a different message type"),
            }
        })
    }

    fn manager_for(&self, name: &str) -> Result<Arc<dyn RecipientManager>, ShardingError> {
        self.managers
            .get(name)
            .map(|entry| Arc::clone(&entry.value().erased))
            .ok_or_else(|| ShardingError::UnknownRecipientType {
                name: name.to_string(),
            })
    }

    /// Register a singleton. It runs whenever this pod owns the sentinel
    /// shard; registration is recorded even when it cannot start yet.
    pub async fn register_singleton(&self, name: impl Into<String>, run: SingletonRun) {
        self.singletons.register(name, run).await;
        self.reconcile_singletons().await;
    }

    async fn reconcile_singletons(&self) {
        let should_run = !self.is_shutting_down()
            && self.assignments.is_owner(SINGLETON_SHARD, &self.self_address);
        self.singletons.reconcile(should_run).await;
    }

    /// Number of singletons currently running on this pod. Mostly for tests.
    pub async fn running_singletons(&self) -> usize {
        self.singletons.running_count().await
    }

    // -----------------------------------------------------------------------
    // Assignment mutations from the Shard Manager
    // -----------------------------------------------------------------------

    /// Take ownership of the given shards. Invoked by the transport layer on
    /// a direct request from the Shard Manager. Ignored while draining.
    #[instrument(skip(self, shards), fields(pod = %self.self_address, count = shards.len()))]
    pub async fn assign_shards(&self, shards: &HashSet<ShardId>) {
        if self.is_shutting_down() {
            return;
        }
        self.assignments.assign(shards, &self.self_address);
        self.metrics
            .shards
            .set(self.assignments.owned_count(&self.self_address) as i64);
        self.reconcile_singletons().await;
    }

    /// Release the given shards, terminating their local entities and
    /// waiting (bounded) for them before returning.
    #[instrument(skip(self, shards), fields(pod = %self.self_address, count = shards.len()))]
    pub async fn unassign_shards(&self, shards: &HashSet<ShardId>) {
        self.assignments.unassign(shards, &self.self_address);
        let managers: Vec<Arc<dyn RecipientManager>> = self
            .managers
            .iter()
            .map(|entry| Arc::clone(&entry.value().erased))
            .collect();
        for manager in managers {
            manager.terminate_entities_on_shards(shards).await;
        }
        self.metrics
            .shards
            .set(self.assignments.owned_count(&self.self_address) as i64);
        self.reconcile_singletons().await;
    }

    // -----------------------------------------------------------------------
    // Assignment refresher
    // -----------------------------------------------------------------------

    fn spawn_refresher(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = this.refresh_assignments() => result,
                };
                match result {
                    Ok(()) => tracing::debug!("assignment change stream ended; restarting"),
                    Err(error) => {
                        tracing::warn!(%error, "assignment refresh pipeline failed; restarting")
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(this.config.refresh_assignments_retry_interval) => {}
                }
            }
        });
        self.background_tasks.lock().push(handle);
    }

    /// One pass of the refresh pipeline: install the authoritative Shard
    /// Manager snapshot, then follow the storage change stream. Change-stream
    /// events are peer information and never overwrite local self entries.
    async fn refresh_assignments(&self) -> Result<(), ShardingError> {
        let snapshot = self.shard_manager.get_assignments().await?;
        self.assignments.install(&snapshot);
        self.after_assignment_update().await;
        self.assignments_ready.open();
        tracing::debug!(entries = snapshot.len(), "installed assignment snapshot");

        let mut stream = self.storage.assignments_stream().await?;
        while let Some(update) = stream.next().await {
            self.assignments.merge(&update, &self.self_address);
            self.after_assignment_update().await;
        }
        Ok(())
    }

    async fn after_assignment_update(&self) {
        self.metrics
            .shards
            .set(self.assignments.owned_count(&self.self_address) as i64);
        self.reconcile_singletons().await;
    }

    // -----------------------------------------------------------------------
    // Unhealthy-pod reporting
    // -----------------------------------------------------------------------

    /// Report an unreachable pod to the Shard Manager, at most once per
    /// `unhealthy_pod_report_interval` across all senders.
    pub(crate) async fn notify_unhealthy_pod(&self, pod: &PodAddress) {
        let now = now_millis();
        let interval = self.config.unhealthy_pod_report_interval.as_millis() as i64;
        let last = self.last_unhealthy_report_ms.load(Ordering::Acquire);
        if now.saturating_sub(last) < interval {
            return;
        }
        if self
            .last_unhealthy_report_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Another sender won the race and reports instead.
            return;
        }
        tracing::warn!(pod = %pod, "reporting unhealthy pod to the shard manager");
        if let Err(error) = self.shard_manager.notify_unhealthy_pod(pod).await {
            tracing::warn!(pod = %pod, %error, "failed to report unhealthy pod");
        }
    }

    // -----------------------------------------------------------------------
    // Send path
    // -----------------------------------------------------------------------

    /// Route a send to the owning pod, retrying transient routing errors.
    ///
    /// All outcomes flow through the reply channel: success via the entity's
    /// reply (or `end` for fire-and-forget), failure via `fail`. Transient
    /// errors retry indefinitely; the caller bounds the attempt with its own
    /// timeout, whose cancellation unwinds the loop.
    ///
    /// Stream-shaped sends share one [`StreamSource`] across attempts: a
    /// failed attempt that pulled nothing leaves the source pristine and is
    /// retried like any single send, while a partially flowed stream cannot
    /// be resent and its failure is surfaced.
    pub(crate) async fn route_send<Msg, Res>(
        &self,
        manager: &Arc<EntityManager<Msg>>,
        entity_id: &str,
        channel: SendChannel<Msg>,
        reply_id: Option<ReplyId>,
        reply: &ReplyChannel<Res>,
    ) where
        Msg: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        Res: DeserializeOwned + Send + Sync + 'static,
    {
        enum Outbound<Msg> {
            Single(Msg),
            Stream(StreamSource<Msg>),
        }
        let outbound = match channel {
            SendChannel::Single(msg) => Outbound::Single(msg),
            SendChannel::Stream(messages) => Outbound::Stream(StreamSource::new(messages)),
        };

        let recipient = manager.recipient_type().clone();
        loop {
            if self.is_shutting_down() && recipient.kind == RecipientKind::Entity {
                reply.fail(ShardingError::entity_not_managed(entity_id));
                return;
            }
            let shard = manager.shard_of(entity_id);
            let Some(pod) = self.assignments.get(shard) else {
                // Unassigned shard: wait for the refresher to learn an owner.
                tokio::time::sleep(self.config.send_retry_interval).await;
                continue;
            };

            let attempt = match &outbound {
                Outbound::Single(msg) => SendChannel::Single(msg.clone()),
                Outbound::Stream(source) => SendChannel::Stream(Box::pin(source.clone())),
            };
            let result = if pod == self.self_address && !self.config.simulate_remote_pods {
                self.deliver_local(manager, entity_id, attempt, reply_id, reply)
                    .await
            } else {
                self.deliver_remote(&pod, &recipient, entity_id, attempt, reply_id, reply)
                    .await
            };

            let pristine = match &outbound {
                Outbound::Single(_) => true,
                Outbound::Stream(source) => source.pulled() == 0,
            };
            match result {
                Ok(()) => return,
                Err(ShardingError::EntityNotManagedByThisPod { entity_id: id }) => {
                    if pristine {
                        tracing::debug!(
                            entity_type = %recipient,
                            entity_id,
                            "routing is stale; retrying after backoff"
                        );
                        tokio::time::sleep(self.config.stale_routing_retry_interval).await;
                    } else {
                        reply.fail(ShardingError::EntityNotManagedByThisPod { entity_id: id });
                        return;
                    }
                }
                Err(ShardingError::PodUnavailable { address }) => {
                    self.notify_unhealthy_pod(&address).await;
                    if pristine {
                        tracing::debug!(
                            pod = %address,
                            "target pod unavailable; retrying after backoff"
                        );
                        tokio::time::sleep(self.config.stale_routing_retry_interval).await;
                    } else {
                        reply.fail(ShardingError::PodUnavailable { address });
                        return;
                    }
                }
                Err(error) => {
                    reply.fail(error);
                    return;
                }
            }
        }
    }

    async fn deliver_local<Msg, Res>(
        &self,
        manager: &Arc<EntityManager<Msg>>,
        entity_id: &str,
        channel: SendChannel<Msg>,
        reply_id: Option<ReplyId>,
        reply: &ReplyChannel<Res>,
    ) -> Result<(), ShardingError>
    where
        Msg: Clone + Send + Sync + 'static,
        Res: Send + Sync + 'static,
    {
        let erased: Arc<dyn ReplyChannelOps> = Arc::new(reply.clone());
        match channel {
            SendChannel::Single(msg) => manager.send(entity_id, msg, reply_id, &erased).await,
            SendChannel::Stream(messages) => {
                manager
                    .send_stream_local(entity_id, messages, reply_id, &erased)
                    .await
            }
        }
    }

    async fn deliver_remote<Msg, Res>(
        &self,
        pod: &PodAddress,
        recipient: &RecipientType,
        entity_id: &str,
        channel: SendChannel<Msg>,
        reply_id: Option<ReplyId>,
        reply: &ReplyChannel<Res>,
    ) -> Result<(), ShardingError>
    where
        Msg: Serialize + Clone + Send + Sync + 'static,
        Res: DeserializeOwned + Send + Sync + 'static,
    {
        match channel {
            SendChannel::Single(msg) => {
                let body = serialization::encode(&msg)?;
                let message =
                    BinaryMessage::new(entity_id, recipient.name.clone(), body, reply_id);
                if reply.is_stream() {
                    let chunks = self.dispatch_message_stream(pod, message).await?;
                    self.pipe_chunks(reply, chunks).await;
                    Ok(())
                } else {
                    let response = self.dispatch_message(pod, message).await?;
                    Self::complete_single(reply, response)
                }
            }
            SendChannel::Stream(messages) => {
                let entity_type = recipient.name.clone();
                let id = entity_id.to_string();
                let reply_for_encode = reply.clone();
                let encoded = messages
                    .map(move |msg| {
                        serialization::encode_chunk(&msg).map(|body| {
                            BinaryMessage::new(id.clone(), entity_type.clone(), body, reply_id)
                        })
                    })
                    .filter_map(move |result| {
                        futures::future::ready(match result {
                            Ok(message) => Some(message),
                            Err(error) => {
                                reply_for_encode.fail(error);
                                None
                            }
                        })
                    })
                    .boxed();
                if reply.is_stream() {
                    let chunks = self
                        .dispatch_stream_and_receive_stream(pod, entity_id, encoded)
                        .await?;
                    self.pipe_chunks(reply, chunks).await;
                    Ok(())
                } else {
                    let response = self.dispatch_stream(pod, entity_id, encoded).await?;
                    Self::complete_single(reply, response)
                }
            }
        }
    }

    fn complete_single<Res: DeserializeOwned + Send + Sync + 'static>(
        reply: &ReplyChannel<Res>,
        response: Option<Vec<u8>>,
    ) -> Result<(), ShardingError> {
        match response {
            Some(bytes) => {
                let value = serialization::decode(&bytes)?;
                reply.reply_single(value);
                Ok(())
            }
            None => {
                reply.end();
                Ok(())
            }
        }
    }

    async fn pipe_chunks<Res: DeserializeOwned + Send + Sync + 'static>(
        &self,
        reply: &ReplyChannel<Res>,
        chunks: BoxStream<'static, Result<Vec<u8>, ShardingError>>,
    ) {
        let decoded = chunks
            .map(|item| item.and_then(|bytes| serialization::decode_chunk::<Res>(&bytes)))
            .boxed();
        reply.reply_stream(decoded).await;
    }

    // With `simulate_remote_pods`, self-targeted dispatch loops through the
    // same binary entry points the transport server uses.
    async fn dispatch_message(
        &self,
        pod: &PodAddress,
        message: BinaryMessage,
    ) -> Result<Option<Vec<u8>>, ShardingError> {
        if *pod == self.self_address {
            self.receive_message(message).await
        } else {
            self.pods.send_message(pod, message).await
        }
    }

    async fn dispatch_message_stream(
        &self,
        pod: &PodAddress,
        message: BinaryMessage,
    ) -> Result<BoxStream<'static, Result<Vec<u8>, ShardingError>>, ShardingError> {
        if *pod == self.self_address {
            Ok(self.receive_message_streamed(message).await?.boxed())
        } else {
            self.pods.send_message_and_receive_stream(pod, message).await
        }
    }

    async fn dispatch_stream(
        &self,
        pod: &PodAddress,
        entity_id: &str,
        messages: BoxStream<'static, BinaryMessage>,
    ) -> Result<Option<Vec<u8>>, ShardingError> {
        if *pod == self.self_address {
            self.receive_stream(messages).await
        } else {
            self.pods.send_stream(pod, entity_id, messages).await
        }
    }

    async fn dispatch_stream_and_receive_stream(
        &self,
        pod: &PodAddress,
        entity_id: &str,
        messages: BoxStream<'static, BinaryMessage>,
    ) -> Result<BoxStream<'static, Result<Vec<u8>, ShardingError>>, ShardingError> {
        if *pod == self.self_address {
            Ok(self.receive_stream_streamed(messages).await?.boxed())
        } else {
            self.pods
                .send_stream_and_receive_stream(pod, entity_id, messages)
                .await
        }
    }

    /// Per-pod leg of a broadcast. No retry: failures become the pod's entry
    /// in the broadcast result.
    pub(crate) async fn broadcast_to_pod<Msg, Res>(
        &self,
        manager: &Arc<EntityManager<Msg>>,
        topic_id: &str,
        pod: &PodAddress,
        msg: Msg,
        reply_id: Option<ReplyId>,
        reply: &ReplyChannel<Res>,
    ) -> Result<(), ShardingError>
    where
        Msg: Serialize + Clone + Send + Sync + 'static,
        Res: DeserializeOwned + Send + Sync + 'static,
    {
        if *pod == self.self_address && !self.config.simulate_remote_pods {
            let erased: Arc<dyn ReplyChannelOps> = Arc::new(reply.clone());
            manager.send(topic_id, msg, reply_id, &erased).await
        } else {
            let body = serialization::encode(&msg)?;
            let message = BinaryMessage::new(
                topic_id,
                manager.recipient_type().name.clone(),
                body,
                reply_id,
            );
            let response = self.dispatch_message(pod, message).await?;
            Self::complete_single(reply, response)
        }
    }

    // -----------------------------------------------------------------------
    // Binary entry points, called by the transport server (and the
    // simulate-remote loop)
    // -----------------------------------------------------------------------

    /// Unary: deliver one message, await at most one reply.
    pub async fn receive_message(
        &self,
        message: BinaryMessage,
    ) -> Result<Option<Vec<u8>>, ShardingError> {
        let manager = self.manager_for(&message.entity_type)?;
        let (channel, output) = ReplyChannel::<Vec<u8>>::single();
        let erased: Arc<dyn ReplyChannelOps> = Arc::new(channel);
        manager
            .send_binary(&message.entity_id, message.body, message.reply_id, erased)
            .await?;
        output.recv().await
    }

    /// Server-streaming: deliver one message, return the reply chunk stream.
    pub async fn receive_message_streamed(
        &self,
        message: BinaryMessage,
    ) -> Result<StreamOutput<Vec<u8>>, ShardingError> {
        let manager = self.manager_for(&message.entity_type)?;
        let (channel, output) = ReplyChannel::<Vec<u8>>::stream();
        let erased: Arc<dyn ReplyChannelOps> = Arc::new(channel);
        manager
            .send_binary(&message.entity_id, message.body, message.reply_id, erased)
            .await?;
        Ok(output)
    }

    /// Client-streaming: deliver a message sequence, await one reply.
    pub async fn receive_stream(
        &self,
        mut messages: BoxStream<'static, BinaryMessage>,
    ) -> Result<Option<Vec<u8>>, ShardingError> {
        let Some(first) = messages.next().await else {
            return Ok(None);
        };
        let manager = self.manager_for(&first.entity_type)?;
        let (channel, output) = ReplyChannel::<Vec<u8>>::single();
        let erased: Arc<dyn ReplyChannelOps> = Arc::new(channel);
        let entity_id = first.entity_id.clone();
        let reply_id = first.reply_id;
        let bodies = futures::stream::once(futures::future::ready(first.body))
            .chain(messages.map(|message| message.body))
            .boxed();
        manager
            .send_binary_stream(&entity_id, bodies, reply_id, erased)
            .await?;
        output.recv().await
    }

    /// Bidirectional: deliver a message sequence, return the chunk stream.
    pub async fn receive_stream_streamed(
        &self,
        mut messages: BoxStream<'static, BinaryMessage>,
    ) -> Result<StreamOutput<Vec<u8>>, ShardingError> {
        let (channel, output) = ReplyChannel::<Vec<u8>>::stream();
        let Some(first) = messages.next().await else {
            channel.end();
            return Ok(output);
        };
        let manager = self.manager_for(&first.entity_type)?;
        let erased: Arc<dyn ReplyChannelOps> = Arc::new(channel);
        let entity_id = first.entity_id.clone();
        let reply_id = first.reply_id;
        let bodies = futures::stream::once(futures::future::ready(first.body))
            .chain(messages.map(|message| message.body))
            .boxed();
        manager
            .send_binary_stream(&entity_id, bodies, reply_id, erased)
            .await?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSharding;
    use futures::FutureExt;
    use serde::Deserialize;
    use tokio::sync::mpsc;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Noop;

    fn idle_behavior(
    ) -> impl Fn(
        crate::entity_manager::EntityContext,
        mpsc::UnboundedReceiver<Noop>,
    ) -> futures::future::BoxFuture<'static, Result<(), ShardingError>>
           + Send
           + Sync
           + 'static {
        |_ctx, mut mailbox: mpsc::UnboundedReceiver<Noop>| {
            async move {
                while mailbox.recv().await.is_some() {}
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn get_shard_id_is_deterministic_and_in_range() {
        let fixture = TestSharding::new().await;
        let sharding = fixture.sharding();
        let a = sharding.get_shard_id("User", "user-1");
        let b = sharding.get_shard_id("User", "user-1");
        assert_eq!(a, b);
        assert!((1..=sharding.config().number_of_shards).contains(&a.0));
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let fixture = TestSharding::new().await;
        fixture
            .sharding()
            .register_entity("User", idle_behavior(), EntityOptions::default())
            .unwrap();
        let err = fixture
            .sharding()
            .register_entity("User", idle_behavior(), EntityOptions::default())
            .unwrap_err();
        assert!(matches!(err, ShardingError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn messenger_rejects_topics_and_unknown_types() {
        let fixture = TestSharding::new().await;
        fixture
            .sharding()
            .register_topic("Events", idle_behavior(), EntityOptions::default())
            .unwrap();

        assert!(matches!(
            fixture.sharding().messenger::<Noop>("Events").unwrap_err(),
            ShardingError::InvalidConfig { .. }
        ));
        assert!(matches!(
            fixture.sharding().messenger::<Noop>("Missing").unwrap_err(),
            ShardingError::UnknownRecipientType { .. }
        ));
        assert!(matches!(
            fixture.sharding().broadcaster::<Noop>("Missing").unwrap_err(),
            ShardingError::UnknownRecipientType { .. }
        ));
    }

    #[tokio::test]
    async fn assignments_cover_all_shards_after_register() {
        let fixture = TestSharding::new().await;
        let sharding = fixture.sharding();
        for shard in 1..=sharding.config().number_of_shards {
            assert!(sharding.is_entity_on_local_shards(ShardId(shard)));
        }
        assert_eq!(sharding.pods_snapshot().len(), 1);
    }
}
