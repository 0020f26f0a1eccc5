//! Event stream bridge.
//!
//! Streaming bodies never travel inline. They are split into EVENT_ITERATOR
//! messages on the sending side and reassembled on the receiving side:
//!
//! - [`resolve_event_iterator`]: drives a local [`EventStream`] and hands
//!   each chunk to an async `send` callback, one chunk at a time
//! - [`EventIterator`]: a [`Stream`] that pulls chunks for one exchange out
//!   of an [`AsyncIdQueue`] lane
//!
//! # Termination
//!
//! An [`EventIterator`] runs its cleanup callback exactly once, with:
//!
//! - [`CleanupReason::Next`] when the stream ended on a `done` or `error` event
//! - [`CleanupReason::Abort`] when the consumer gave up early
//!   ([`EventIterator::abort`] or drop)
//! - [`CleanupReason::Error`] when the lane was closed while pulling

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, ready};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::Value;

use crate::error::{PeerError, Result};
use crate::message::{EventKind, EventMeta, EventPayload};
use crate::queue::AsyncIdQueue;

/// A streamed value with optional per-value meta.
#[derive(Clone, Debug, PartialEq)]
pub struct EventValue {
    data: Value,
    meta: Option<EventMeta>,
}

impl EventValue {
    pub fn new(data: Value) -> Self {
        Self { data, meta: None }
    }

    /// Attach meta (resume id, retry delay, comments) to this value.
    pub fn with_meta(mut self, meta: EventMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn meta(&self) -> Option<&EventMeta> {
        self.meta.as_ref()
    }

    pub fn into_data(self) -> Value {
        self.data
    }

    pub(crate) fn into_parts(self) -> (Value, Option<EventMeta>) {
        (self.data, self.meta)
    }
}

impl From<Value> for EventValue {
    fn from(data: Value) -> Self {
        Self::new(data)
    }
}

/// What the producer should do after a chunk was handed to `send`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Keep producing.
    Next,
    /// Stop producing and drop the stream.
    Abort,
}

/// Why an [`EventIterator`] terminated.
#[derive(Clone, Debug)]
pub enum CleanupReason {
    /// The remote side ended the stream (`done` or `error` event).
    Next,
    /// The consumer stopped reading early.
    Abort,
    /// The lane was closed while a pull was pending.
    Error(PeerError),
}

impl CleanupReason {
    pub fn is_next(&self) -> bool {
        matches!(self, CleanupReason::Next)
    }
}

type Cleanup = Box<dyn FnOnce(CleanupReason) -> BoxFuture<'static, Result<()>> + Send>;

struct Shared {
    queue: Arc<AsyncIdQueue<EventPayload>>,
    id: String,
    cleanup: Mutex<Option<Cleanup>>,
    returned: Mutex<Option<EventValue>>,
}

impl Shared {
    fn take_cleanup(&self) -> Option<Cleanup> {
        self.cleanup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn finish(&self, reason: CleanupReason) -> Result<()> {
        match self.take_cleanup() {
            Some(cleanup) => cleanup(reason).await,
            None => Ok(()),
        }
    }
}

/// Output of one pull: the item to yield and whether the stream is over.
type Step = (Option<Result<EventValue>>, bool);

async fn step(shared: Arc<Shared>) -> Step {
    let payload = match shared.queue.pull(&shared.id).await {
        Ok(payload) => payload,
        Err(reason) => {
            let item = match shared.finish(CleanupReason::Error(reason.clone())).await {
                Ok(()) => Err(reason),
                Err(cleanup_err) => Err(cleanup_err),
            };
            return (Some(item), true);
        }
    };

    match payload.event {
        EventKind::Message => (Some(Ok(payload.into_value())), false),
        EventKind::Done => {
            if payload.data.is_some() || payload.meta.is_some() {
                *shared
                    .returned
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(payload.into_value());
            }
            let item = shared.finish(CleanupReason::Next).await.err().map(Err);
            (item, true)
        }
        EventKind::Error => {
            let err = payload.into_error();
            let item = match shared.finish(CleanupReason::Next).await {
                Ok(()) => Err(err),
                Err(cleanup_err) => Err(cleanup_err),
            };
            (Some(item), true)
        }
    }
}

/// Consumer side of a remote event stream.
///
/// Yields `message` values in order, ends on `done` (keeping its value as
/// [`return_value`](EventIterator::return_value)) and yields a final
/// [`PeerError::Event`] on `error`.
///
/// Dropping an unfinished iterator runs the cleanup with
/// [`CleanupReason::Abort`] on a spawned task; use
/// [`abort`](EventIterator::abort) to observe the cleanup result instead.
pub struct EventIterator {
    shared: Arc<Shared>,
    pending: Option<BoxFuture<'static, Step>>,
    finished: bool,
}

impl EventIterator {
    /// Create an iterator over the `id` lane of `queue`.
    pub fn new<F, Fut>(queue: Arc<AsyncIdQueue<EventPayload>>, id: impl Into<String>, cleanup: F) -> Self
    where
        F: FnOnce(CleanupReason) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let cleanup: Cleanup = Box::new(move |reason| cleanup(reason).boxed());
        Self {
            shared: Arc::new(Shared {
                queue,
                id: id.into(),
                cleanup: Mutex::new(Some(cleanup)),
                returned: Mutex::new(None),
            }),
            pending: None,
            finished: false,
        }
    }

    /// The correlation id this iterator reads.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Returns whether the stream has terminated.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The value carried by the `done` event, once received.
    pub fn return_value(&self) -> Option<EventValue> {
        self.shared
            .returned
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop reading early.
    ///
    /// Runs the cleanup with [`CleanupReason::Abort`] unless the stream
    /// already terminated, and returns the cleanup's error, if any.
    pub async fn abort(mut self) -> Result<()> {
        self.pending = None;
        self.finished = true;
        self.shared.finish(CleanupReason::Abort).await
    }
}

impl Stream for EventIterator {
    type Item = Result<EventValue>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        let shared = &this.shared;
        let pending = this
            .pending
            .get_or_insert_with(|| step(shared.clone()).boxed());
        let (item, terminal) = ready!(pending.as_mut().poll(cx));
        this.pending = None;
        if terminal || item.is_none() {
            this.finished = true;
        }
        Poll::Ready(item)
    }
}

impl Drop for EventIterator {
    fn drop(&mut self) {
        let Some(cleanup) = self.shared.take_cleanup() else {
            return;
        };
        let id = self.shared.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = cleanup(CleanupReason::Abort).await {
                        tracing::warn!(id = %id, error = %err, "event stream cleanup failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(id = %id, "event stream dropped outside a runtime, cleanup skipped");
            }
        }
    }
}

impl std::fmt::Debug for EventIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventIterator")
            .field("id", &self.shared.id)
            .field("finished", &self.finished)
            .finish()
    }
}

enum Source {
    Local(BoxStream<'static, Result<EventValue>>),
    Remote(EventIterator),
}

/// An incremental body: a local producer or a remote [`EventIterator`].
///
/// Yields values until the producer ends; an `Err` item ends the stream.
/// The optional return value becomes the data of the final `done` event.
///
/// # Example
///
/// ```
/// use peerwire_core::{EventMeta, EventStream, EventValue};
/// use serde_json::json;
///
/// let stream = EventStream::from_values(vec![
///     EventValue::new(json!("hello")),
///     EventValue::new(json!({"n": 1})).with_meta(EventMeta::new().id("id-1")),
/// ])
/// .with_return(EventValue::new(json!("bye")));
/// # drop(stream);
/// ```
pub struct EventStream {
    source: Source,
    returns: Option<EventValue>,
}

impl EventStream {
    /// Wrap a local producer.
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<EventValue>> + Send + 'static,
    {
        Self {
            source: Source::Local(stream.boxed()),
            returns: None,
        }
    }

    /// A producer yielding `values` in order.
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = EventValue>,
        I::IntoIter: Send + 'static,
    {
        Self::new(futures::stream::iter(values.into_iter().map(Ok)))
    }

    /// Set the value sent with the `done` event.
    pub fn with_return(mut self, value: EventValue) -> Self {
        self.returns = Some(value);
        self
    }

    /// Returns whether this stream reads from a remote peer.
    pub fn is_remote(&self) -> bool {
        matches!(self.source, Source::Remote(_))
    }

    /// The final value: the one set with [`with_return`](Self::with_return),
    /// or for a remote stream the value of its `done` event.
    pub fn return_value(&self) -> Option<EventValue> {
        match (&self.returns, &self.source) {
            (Some(value), _) => Some(value.clone()),
            (None, Source::Remote(iterator)) => iterator.return_value(),
            (None, Source::Local(_)) => None,
        }
    }

    /// Stop reading early.
    ///
    /// Remote streams run their cleanup and return its error; local
    /// producers are dropped.
    pub async fn abort(self) -> Result<()> {
        match self.source {
            Source::Remote(iterator) => iterator.abort().await,
            Source::Local(stream) => {
                drop(stream);
                Ok(())
            }
        }
    }
}

impl From<EventIterator> for EventStream {
    fn from(iterator: EventIterator) -> Self {
        Self {
            source: Source::Remote(iterator),
            returns: None,
        }
    }
}

impl Stream for EventStream {
    type Item = Result<EventValue>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().source {
            Source::Local(stream) => stream.poll_next_unpin(cx),
            Source::Remote(iterator) => iterator.poll_next_unpin(cx),
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("EventStream");
        match &self.source {
            Source::Local(_) => s.field("source", &"local"),
            Source::Remote(iterator) => s.field("source", iterator),
        };
        s.field("returns", &self.returns).finish()
    }
}

/// Drive `stream` to completion, handing each chunk to `send`.
///
/// The next value is not pulled until `send` for the previous one
/// resolved. The stream ends with exactly one `done` or `error` event:
///
/// - natural end: `done` with [`EventStream::return_value`]
/// - [`PeerError::Event`]: `error` with its data and meta
/// - any other error: `error` without data
///
/// A producer error is returned once its `error` event was sent, so the
/// producing side can still report it.
///
/// When `send` answers [`Direction::Abort`] or fails, the stream is dropped
/// without sending anything else; a failing `send` error is returned.
pub async fn resolve_event_iterator<F, Fut>(mut stream: EventStream, mut send: F) -> Result<()>
where
    F: FnMut(EventPayload) -> Fut,
    Fut: Future<Output = Result<Direction>>,
{
    loop {
        let (payload, failure) = match stream.next().await {
            Some(Ok(value)) => (EventPayload::message(value), None),
            Some(Err(err)) => (EventPayload::error(&err), Some(err)),
            None => (EventPayload::done(stream.return_value()), None),
        };
        let terminal = payload.event != EventKind::Message;

        let direction = send(payload).await?;

        if terminal {
            return match failure {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }
        if direction == Direction::Abort {
            drop(stream);
            return Ok(());
        }
    }
}
