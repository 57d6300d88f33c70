//! Reply channels: the caller-side sink for a request's response(s).
//!
//! A [`ReplyChannel`] decouples the caller's expected arity (single value or
//! stream of chunks) from how the response travels: filled in directly on the
//! local shortcut, or fed decoded bytes from a transport call. Producer
//! handles are cheap clones; the consumer side is returned separately by the
//! constructors, mpsc-style.

use crate::error::ShardingError;
use crate::serialization;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identifier tying a dispatched request to its registered reply channel.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplyId(Uuid);

impl ReplyId {
    /// A fresh random reply ID.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ReplyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
enum StreamEvent<Res> {
    Item(Res),
    End,
    Fail(ShardingError),
}

enum Sink<Res> {
    Single(mpsc::UnboundedSender<Result<Option<Res>, ShardingError>>),
    Stream(mpsc::UnboundedSender<StreamEvent<Res>>),
}

struct Inner<Res> {
    sink: Sink<Res>,
    /// Set by the first terminal transition; later signals are no-ops.
    completed: AtomicBool,
    done: CancellationToken,
}

impl<Res> Inner<Res> {
    /// Claim the terminal transition. Returns false if already completed.
    fn complete(&self) -> bool {
        !self.completed.swap(true, Ordering::AcqRel)
    }
}

/// Producer handle of a reply channel, either single-shot or streaming.
pub struct ReplyChannel<Res> {
    inner: Arc<Inner<Res>>,
}

impl<Res> Clone for ReplyChannel<Res> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Res: Send + 'static> ReplyChannel<Res> {
    /// A single-shot channel: completes with `Some(value)`, `None`, or a failure.
    pub fn single() -> (Self, SingleOutput<Res>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            inner: Arc::new(Inner {
                sink: Sink::Single(tx),
                completed: AtomicBool::new(false),
                done: CancellationToken::new(),
            }),
        };
        (channel, SingleOutput { rx })
    }

    /// A streaming channel: emits a sequence of chunks terminated by end or failure.
    pub fn stream() -> (Self, StreamOutput<Res>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            inner: Arc::new(Inner {
                sink: Sink::Stream(tx),
                completed: AtomicBool::new(false),
                done: CancellationToken::new(),
            }),
        };
        (
            channel,
            StreamOutput {
                rx,
                finished: false,
            },
        )
    }

    /// Whether this channel expects a stream of chunks.
    pub fn is_stream(&self) -> bool {
        matches!(self.inner.sink, Sink::Stream(_))
    }

    /// Complete with a single value. On a stream channel this emits `[value]`
    /// and ends. No-op once the channel is completed.
    pub fn reply_single(&self, value: Res) {
        if !self.inner.complete() {
            return;
        }
        match &self.inner.sink {
            Sink::Single(tx) => {
                let _ = tx.send(Ok(Some(value)));
            }
            Sink::Stream(tx) => {
                let _ = tx.send(StreamEvent::Item(value));
                let _ = tx.send(StreamEvent::End);
            }
        }
        self.inner.done.cancel();
    }

    /// Complete without a value.
    pub fn end(&self) {
        if !self.inner.complete() {
            return;
        }
        match &self.inner.sink {
            Sink::Single(tx) => {
                let _ = tx.send(Ok(None));
            }
            Sink::Stream(tx) => {
                let _ = tx.send(StreamEvent::End);
            }
        }
        self.inner.done.cancel();
    }

    /// Complete with a failure. Idempotent; later signals are ignored.
    pub fn fail(&self, cause: ShardingError) {
        if !self.inner.complete() {
            return;
        }
        match &self.inner.sink {
            Sink::Single(tx) => {
                let _ = tx.send(Err(cause));
            }
            Sink::Stream(tx) => {
                let _ = tx.send(StreamEvent::Fail(cause));
            }
        }
        self.inner.done.cancel();
    }

    /// Feed this channel from a source stream.
    ///
    /// On a single channel only the first element is consumed: the channel
    /// completes with `Some(first)`, `None` if the source is empty, or the
    /// source's error. The remainder of the source is dropped, propagating
    /// cancellation upstream.
    ///
    /// On a stream channel the source is copied element by element until it
    /// ends or fails; the copy races consumer departure and terminal
    /// transitions from other producer handles, and exits on either.
    pub async fn reply_stream(&self, mut source: BoxStream<'static, Result<Res, ShardingError>>) {
        match &self.inner.sink {
            Sink::Single(_) => match source.next().await {
                Some(Ok(value)) => self.reply_single(value),
                Some(Err(cause)) => self.fail(cause),
                None => self.end(),
            },
            Sink::Stream(tx) => loop {
                if self.inner.completed.load(Ordering::Acquire) {
                    break;
                }
                tokio::select! {
                    biased;
                    _ = tx.closed() => break,
                    _ = self.inner.done.cancelled() => break,
                    next = source.next() => match next {
                        Some(Ok(value)) => {
                            if tx.send(StreamEvent::Item(value)).is_err() {
                                break;
                            }
                        }
                        Some(Err(cause)) => {
                            self.fail(cause);
                            break;
                        }
                        None => {
                            self.end();
                            break;
                        }
                    }
                }
            },
        }
    }

    /// Wait for any terminal transition, or for the consumer to go away.
    pub async fn wait_done(&self) {
        let consumer_gone = async {
            match &self.inner.sink {
                Sink::Single(tx) => tx.closed().await,
                Sink::Stream(tx) => tx.closed().await,
            }
        };
        tokio::select! {
            _ = self.inner.done.cancelled() => {}
            _ = consumer_gone => {}
        }
    }
}

/// Consumer side of a single-shot reply channel.
pub struct SingleOutput<Res> {
    rx: mpsc::UnboundedReceiver<Result<Option<Res>, ShardingError>>,
}

impl<Res> SingleOutput<Res> {
    /// Await the outcome. Resolves to `Ok(None)` if every producer handle was
    /// dropped before a terminal signal (e.g. a cancelled send).
    pub async fn recv(mut self) -> Result<Option<Res>, ShardingError> {
        self.rx.recv().await.unwrap_or(Ok(None))
    }
}

/// Consumer side of a streaming reply channel. A lazy finite sequence of
/// chunks that may end with a failure.
pub struct StreamOutput<Res> {
    rx: mpsc::UnboundedReceiver<StreamEvent<Res>>,
    finished: bool,
}

impl<Res> Stream for StreamOutput<Res> {
    type Item = Result<Res, ShardingError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(StreamEvent::Item(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(StreamEvent::End)) | Poll::Ready(None) => {
                this.finished = true;
                this.rx.close();
                Poll::Ready(None)
            }
            Poll::Ready(Some(StreamEvent::Fail(cause))) => {
                this.finished = true;
                this.rx.close();
                Poll::Ready(Some(Err(cause)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Type-erased view of a reply channel, as stored in the [`ReplyRegistry`].
///
/// The downcast back to a concrete `ReplyChannel<Res>` (typed, local path) or
/// `ReplyChannel<Vec<u8>>` (binary, remote-serving path) happens only in the
/// registry's reply-routing methods.
pub(crate) trait ReplyChannelOps: Send + Sync {
    fn end(&self);
    fn fail(&self, cause: ShardingError);
    fn wait_done(&self) -> BoxFuture<'static, ()>;
    fn as_any(&self) -> &dyn Any;
}

impl<Res: Send + Sync + 'static> ReplyChannelOps for ReplyChannel<Res> {
    fn end(&self) {
        ReplyChannel::end(self);
    }

    fn fail(&self, cause: ShardingError) {
        ReplyChannel::fail(self, cause);
    }

    fn wait_done(&self) -> BoxFuture<'static, ()> {
        let channel = self.clone();
        Box::pin(async move { channel.wait_done().await })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Registry of in-flight reply channels, keyed by reply ID.
///
/// Entries have no TTL: a completion hook armed at registration removes the
/// entry as soon as the channel reaches a terminal state or loses its
/// consumer.
#[derive(Clone)]
pub(crate) struct ReplyRegistry {
    channels: Arc<DashMap<ReplyId, Arc<dyn ReplyChannelOps>>>,
}

impl ReplyRegistry {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
        }
    }

    /// Register a channel under the given ID and arm its completion hook.
    /// Registering the same ID twice keeps the first entry.
    pub fn register(&self, id: ReplyId, channel: Arc<dyn ReplyChannelOps>) {
        use dashmap::mapref::entry::Entry;
        match self.channels.entry(id) {
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&channel));
                let channels = Arc::clone(&self.channels);
                tokio::spawn(async move {
                    channel.wait_done().await;
                    channels.remove(&id);
                });
            }
        }
    }

    pub fn get(&self, id: &ReplyId) -> Option<Arc<dyn ReplyChannelOps>> {
        self.channels.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Route a single typed reply to the channel registered under `id`.
    ///
    /// Local callers registered a `ReplyChannel<Res>`; a pod serving a remote
    /// request registered a `ReplyChannel<Vec<u8>>` whose output feeds the
    /// transport, so the value is encoded first in that case.
    pub fn reply_single<Res>(&self, id: ReplyId, value: Res)
    where
        Res: Serialize + Send + Sync + 'static,
    {
        let Some(channel) = self.get(&id) else {
            tracing::debug!(reply_id = %id, "no reply channel registered; dropping reply");
            return;
        };
        if let Some(typed) = channel.as_any().downcast_ref::<ReplyChannel<Res>>() {
            typed.reply_single(value);
        } else if let Some(binary) = channel.as_any().downcast_ref::<ReplyChannel<Vec<u8>>>() {
            match serialization::encode(&value) {
                Ok(bytes) => binary.reply_single(bytes),
                Err(cause) => binary.fail(cause),
            }
        } else {
            tracing::warn!(reply_id = %id, "reply channel type mismatch; dropping reply");
        }
    }

    /// Route a typed reply stream to the channel registered under `id`.
    pub async fn reply_stream<Res>(&self, id: ReplyId, source: BoxStream<'static, Res>)
    where
        Res: Serialize + Send + Sync + 'static,
    {
        let Some(channel) = self.get(&id) else {
            tracing::debug!(reply_id = %id, "no reply channel registered; dropping reply stream");
            return;
        };
        if let Some(typed) = channel.as_any().downcast_ref::<ReplyChannel<Res>>() {
            typed.reply_stream(source.map(Ok).boxed()).await;
        } else if let Some(binary) = channel.as_any().downcast_ref::<ReplyChannel<Vec<u8>>>() {
            binary
                .reply_stream(
                    source
                        .map(|value| serialization::encode_chunk(&value))
                        .boxed(),
                )
                .await;
        } else {
            tracing::warn!(reply_id = %id, "reply channel type mismatch; dropping reply stream");
        }
    }
}

/// Caller-provided capability to reply once, embedded in a request message.
/// Serializes as the bare reply ID.
#[derive(Debug, Serialize, Deserialize)]
pub struct Replier<Res> {
    pub id: ReplyId,
    #[serde(skip)]
    _marker: PhantomData<fn() -> Res>,
}

impl<Res> Clone for Replier<Res> {
    fn clone(&self) -> Self {
        Self::new(self.id)
    }
}

impl<Res> Replier<Res> {
    pub fn new(id: ReplyId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }
}

/// Caller-provided capability to reply with a stream of chunks.
#[derive(Debug, Serialize, Deserialize)]
pub struct StreamReplier<Res> {
    pub id: ReplyId,
    #[serde(skip)]
    _marker: PhantomData<fn() -> Res>,
}

impl<Res> Clone for StreamReplier<Res> {
    fn clone(&self) -> Self {
        Self::new(self.id)
    }
}

impl<Res> StreamReplier<Res> {
    pub fn new(id: ReplyId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }
}
