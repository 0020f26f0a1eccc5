//! Client side of the peer protocol.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use peerwire_core::{
    AsyncIdQueue, Body, CancellationToken, Direction, EncodedMessage, ErrorReporter, EventIterator,
    EventPayload, EventStream, IdGenerator, PeerError, Request, Response, ResponseMessage, Result,
    Transport, decode_response_message, encode_abort, encode_event, encode_request,
    resolve_event_iterator,
};

#[cfg(feature = "tracing")]
use tracing::Instrument;

use crate::builder::ClientPeerBuilder;

type Cleanup = Box<dyn FnOnce() + Send>;

/// Bookkeeping for one in-flight exchange.
struct Exchange {
    /// Cancelled on ABORT_SIGNAL from the server or when the exchange closes.
    controller: CancellationToken,
    /// Run once when the exchange closes.
    cleanups: Vec<Cleanup>,
}

struct Inner<T> {
    transport: T,
    ids: Arc<dyn IdGenerator>,
    responses: AsyncIdQueue<Response>,
    events: Arc<AsyncIdQueue<EventPayload>>,
    exchanges: Mutex<HashMap<String, Exchange>>,
    errors: ErrorReporter,
}

/// Issues requests over a [`Transport`] and correlates the replies.
///
/// Inbound messages from the server must be fed to
/// [`message`](ClientPeer::message). Cloning is cheap; clones share all
/// state.
///
/// # Example
///
/// ```ignore
/// use peerwire_client::ClientPeer;
/// use peerwire_core::{Request, internal_url};
/// use serde_json::json;
///
/// let peer = ClientPeer::new(transport);
///
/// // Feed server messages back in from the receiving half of the channel.
/// tokio::spawn({
///     let peer = peer.clone();
///     async move {
///         while let Some(raw) = incoming.recv().await {
///             peer.message(raw).await?;
///         }
///         Ok::<_, peerwire_core::PeerError>(())
///     }
/// });
///
/// let response = peer
///     .request(Request::new(internal_url("/planet/find")?).body(json!({"name": "earth"})))
///     .await?;
/// ```
pub struct ClientPeer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ClientPeer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ClientPeer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPeer")
            .field("open", &self.len())
            .field("errors", &self.inner.errors)
            .finish()
    }
}

impl<T> ClientPeer<T> {
    fn exchanges(&self) -> MutexGuard<'_, HashMap<String, Exchange>> {
        self.inner
            .exchanges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of open exchanges.
    pub fn len(&self) -> usize {
        self.exchanges().len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges().is_empty()
    }
}

impl<T: Transport> ClientPeer<T> {
    /// Create a peer with default settings.
    pub fn new(transport: T) -> Self {
        ClientPeerBuilder::new(transport).build()
    }

    /// Create a [`ClientPeerBuilder`] to configure the peer.
    pub fn builder(transport: T) -> ClientPeerBuilder<T> {
        ClientPeerBuilder::new(transport)
    }

    pub(crate) fn from_parts(transport: T, ids: Arc<dyn IdGenerator>, errors: ErrorReporter) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                ids,
                responses: AsyncIdQueue::new(),
                events: Arc::new(AsyncIdQueue::new()),
                exchanges: Mutex::new(HashMap::new()),
                errors,
            }),
        }
    }

    /// Send `request` and wait for its response.
    ///
    /// A streaming request body is sent as EVENT_ITERATOR messages after the
    /// REQUEST. A streaming response comes back as a [`Body::Stream`];
    /// dropping it before the end aborts the exchange on the server.
    ///
    /// # Cancellation
    ///
    /// When [`Request::cancellation`] fires, an ABORT_SIGNAL is sent and the
    /// call fails with the token's reason. A token that is already
    /// cancelled fails the call before anything is sent.
    ///
    /// # Errors
    ///
    /// - the token's reason when cancelled
    /// - [`PeerError::Encode`] / [`PeerError::Transport`] if the REQUEST
    ///   could not be sent
    /// - the close reason when the exchange is closed while waiting
    pub async fn request(&self, mut request: Request) -> Result<Response> {
        let signal = request.cancellation.take();
        if let Some(reason) = signal.as_ref().and_then(CancellationToken::reason) {
            return Err(reason);
        }

        let id = self.inner.ids.generate();

        #[cfg(feature = "tracing")]
        let span = tracing::info_span!(
            "peer.request",
            peer.id = %id,
            peer.method = %request.method,
            peer.url = %request.url,
            otel.kind = "client",
        );

        let exchange = self.exchange(id, request, signal);

        #[cfg(feature = "tracing")]
        let exchange = exchange.instrument(span);

        exchange.await
    }

    async fn exchange(
        &self,
        id: String,
        request: Request,
        signal: Option<CancellationToken>,
    ) -> Result<Response> {
        let controller = self.open(&id);
        match self.drive(&id, request, signal, controller).await {
            Ok(response) => Ok(response),
            Err(err) => {
                self.close(Some(&id), Some(err.clone()));
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        id: &str,
        mut request: Request,
        signal: Option<CancellationToken>,
        controller: CancellationToken,
    ) -> Result<Response> {
        let message = encode_request(id, &request)?;
        let body = request.body.take_stream();
        self.inner.transport.send(message).await?;

        // Closed while the REQUEST was in flight.
        if !self.is_open(id) {
            return Err(controller.reason().unwrap_or_else(|| PeerError::Closed {
                id: id.to_owned(),
            }));
        }

        if let Some(signal) = signal {
            if let Some(reason) = signal.reason() {
                if self.is_open(id) {
                    self.send_abort(id).await;
                }
                return Err(reason);
            }
            self.watch(id, signal);
        }

        if let Some(body) = body {
            self.spawn_producer(id, body, controller);
        }

        let mut response = self.inner.responses.pull(id).await?;
        if response.is_event_stream() {
            response.body = Body::Stream(EventStream::from(self.response_stream(id)));
        } else {
            self.close(Some(id), None);
        }
        Ok(response)
    }

    fn open(&self, id: &str) -> CancellationToken {
        let controller = CancellationToken::new();
        self.exchanges().insert(
            id.to_owned(),
            Exchange {
                controller: controller.clone(),
                cleanups: Vec::new(),
            },
        );
        self.inner.responses.open(id);
        self.inner.events.open(id);
        log_debug(id, "exchange opened");
        controller
    }

    fn is_open(&self, id: &str) -> bool {
        self.exchanges().contains_key(id)
    }

    /// Register `cleanup` for exchange `id`; runs it now if already closed.
    fn add_cleanup(&self, id: &str, cleanup: Cleanup) {
        let rejected = match self.exchanges().get_mut(id) {
            Some(exchange) => {
                exchange.cleanups.push(cleanup);
                None
            }
            None => Some(cleanup),
        };
        if let Some(cleanup) = rejected {
            cleanup();
        }
    }

    async fn send_abort(&self, id: &str) {
        let result = match encode_abort(id) {
            Ok(message) => self.inner.transport.send(message).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            self.inner.errors.report(id, "sending abort signal", &err);
        }
    }

    /// Abort the exchange when the caller's token fires.
    fn watch(&self, id: &str, signal: CancellationToken) {
        let peer = self.clone();
        let watched = id.to_owned();
        let watcher = tokio::spawn(async move {
            let reason = signal.cancelled().await;
            peer.send_abort(&watched).await;
            peer.close(Some(&watched), Some(reason));
        });
        self.add_cleanup(id, Box::new(move || watcher.abort()));
    }

    fn spawn_producer(&self, id: &str, body: EventStream, controller: CancellationToken) {
        let peer = self.clone();
        let id = id.to_owned();
        tokio::spawn(async move {
            let (sender, chunk_id, stop) = (&peer, id.as_str(), &controller);
            let result = resolve_event_iterator(body, move |payload| async move {
                if stop.is_cancelled() {
                    return Ok(Direction::Abort);
                }
                sender
                    .inner
                    .transport
                    .send(encode_event(chunk_id, &payload)?)
                    .await?;
                Ok(Direction::Next)
            })
            .await;

            if let Err(err) = result {
                peer.inner.errors.report(&id, "streaming request body", &err);
            }
        });
    }

    /// Consumer for a streaming response body.
    fn response_stream(&self, id: &str) -> EventIterator {
        let peer = self.clone();
        let stream_id = id.to_owned();
        EventIterator::new(self.inner.events.clone(), id, move |reason| async move {
            let result = if !reason.is_next() && peer.inner.events.is_open(&stream_id) {
                match encode_abort(&stream_id) {
                    Ok(message) => peer.inner.transport.send(message).await,
                    Err(err) => Err(err),
                }
            } else {
                Ok(())
            };
            if let Err(err) = &result {
                peer.inner.errors.report(&stream_id, "sending abort signal", err);
            }
            peer.close(Some(&stream_id), None);
            result
        })
    }

    /// Feed a message received from the server.
    ///
    /// Messages for exchanges that are no longer open are discarded.
    ///
    /// # Errors
    ///
    /// [`PeerError::Decode`] if the message is malformed; other exchanges
    /// are unaffected.
    pub async fn message(&self, raw: EncodedMessage) -> Result<()> {
        let (id, message) = decode_response_message(raw).await?;

        match message {
            ResponseMessage::Abort => {
                let controller = self
                    .exchanges()
                    .get(&id)
                    .map(|exchange| exchange.controller.clone());
                match controller {
                    Some(controller) => {
                        controller.cancel(PeerError::aborted("server aborted the exchange"));
                    }
                    None => log_debug(&id, "discarding abort signal for a closed exchange"),
                }
            }
            ResponseMessage::Event(payload) => {
                if !self.inner.events.push(&id, payload) {
                    log_debug(&id, "discarding event for a closed exchange");
                }
            }
            ResponseMessage::Response(response) => {
                if !self.inner.responses.push(&id, response) {
                    log_debug(&id, "discarding response for a closed exchange");
                }
            }
        }
        Ok(())
    }

    /// Close exchange `id`, or every open exchange when `id` is `None`.
    ///
    /// Pending [`request`](Self::request) calls and response streams fail
    /// with `reason`, or [`PeerError::Closed`] when none is given. Nothing
    /// is sent to the server.
    pub fn close(&self, id: Option<&str>, reason: Option<PeerError>) {
        let closed: Vec<(String, Exchange)> = {
            let mut exchanges = self.exchanges();
            match id {
                Some(id) => exchanges.remove_entry(id).into_iter().collect(),
                None => exchanges.drain().collect(),
            }
        };

        for (id, exchange) in closed {
            exchange.controller.cancel(
                reason
                    .clone()
                    .unwrap_or_else(|| PeerError::Closed { id: id.clone() }),
            );
            for cleanup in exchange.cleanups {
                cleanup();
            }
            log_debug(&id, "exchange closed");
        }

        self.inner.responses.close(id, reason.clone());
        self.inner.events.close(id, reason);
    }
}

fn log_debug(id: &str, message: &str) {
    #[cfg(feature = "tracing")]
    tracing::debug!(id = %id, "{message}");
    #[cfg(not(feature = "tracing"))]
    let _ = (id, message);
}
