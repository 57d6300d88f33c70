use futures::stream::BoxStream;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

/// Outbound payload shape for a send: one message or a stream of messages.
///
/// Combined with the reply channel's variant this selects the transport
/// shape for a remote dispatch (unary, server-streaming, client-streaming,
/// or bidirectional).
pub enum SendChannel<Msg> {
    Single(Msg),
    Stream(BoxStream<'static, Msg>),
}

/// Outbound message source shared across routing attempts.
///
/// Each dispatch attempt pulls from the same underlying stream through a
/// cheap clone, and every pulled element is counted. An attempt that fails
/// before pulling anything leaves the source pristine, so the router can
/// retry the full send; once elements have flowed they cannot be resent,
/// and the router surfaces the failure instead.
pub(crate) struct StreamSource<T> {
    inner: Arc<SourceInner<T>>,
}

struct SourceInner<T> {
    stream: parking_lot::Mutex<BoxStream<'static, T>>,
    pulled: AtomicUsize,
}

impl<T> Clone for StreamSource<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> StreamSource<T> {
    pub fn new(stream: BoxStream<'static, T>) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                stream: parking_lot::Mutex::new(stream),
                pulled: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of elements pulled from the source so far, across all handles.
    pub fn pulled(&self) -> usize {
        self.inner.pulled.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> Stream for StreamSource<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let inner = &self.get_mut().inner;
        let mut stream = inner.stream.lock();
        match stream.as_mut().poll_next(cx) {
            Poll::Ready(Some(item)) => {
                inner.pulled.fetch_add(1, Ordering::AcqRel);
                Poll::Ready(Some(item))
            }
            other => other,
        }
    }
}
