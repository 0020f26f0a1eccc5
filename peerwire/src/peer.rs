//! Server side of the peer protocol.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use peerwire_core::{
    AsyncIdQueue, Body, CancellationToken, Direction, EncodedMessage, ErrorReporter, EventIterator,
    EventPayload, EventStream, PeerError, Request, RequestMessage, Response, Result, Transport,
    decode_request_message, encode_abort, encode_event, encode_response, resolve_event_iterator,
};

use crate::builder::ServerPeerBuilder;

struct Inner<T> {
    transport: T,
    /// Inbound chunks of streaming request bodies.
    events: Arc<AsyncIdQueue<EventPayload>>,
    /// One controller per open exchange; handlers observe it through
    /// [`Request::cancellation`].
    controllers: Mutex<HashMap<String, CancellationToken>>,
    errors: ErrorReporter,
}

/// Receives requests over a [`Transport`] and sends back responses.
///
/// Feed every message from the client, in arrival order, to
/// [`message`](ServerPeer::message). Run the handler for a returned
/// request on its own task and answer with
/// [`response`](ServerPeer::response), so ABORT_SIGNAL and EVENT_ITERATOR
/// messages keep flowing while it runs.
/// [`message_with_handler`](ServerPeer::message_with_handler) does both in
/// one call for transports that deliver one exchange at a time.
///
/// # Example
///
/// ```ignore
/// use peerwire::prelude::*;
///
/// let peer = ServerPeer::new(transport);
/// while let Some(raw) = incoming.recv().await {
///     let Ok((id, Some(request))) = peer.message(raw).await else {
///         continue;
///     };
///     let peer = peer.clone();
///     tokio::spawn(async move {
///         let response = Response::new(serde_json::json!({"path": request.url.path()}));
///         peer.response(&id, response).await
///     });
/// }
/// ```
pub struct ServerPeer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ServerPeer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for ServerPeer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPeer")
            .field("open", &self.len())
            .field("errors", &self.inner.errors)
            .finish()
    }
}

impl<T> ServerPeer<T> {
    fn controllers(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.inner
            .controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of open exchanges.
    pub fn len(&self) -> usize {
        self.controllers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.controllers().is_empty()
    }
}

impl<T: Transport> ServerPeer<T> {
    /// Create a peer with default settings.
    pub fn new(transport: T) -> Self {
        ServerPeerBuilder::new(transport).build()
    }

    /// Create a [`ServerPeerBuilder`] to configure the peer.
    pub fn builder(transport: T) -> ServerPeerBuilder<T> {
        ServerPeerBuilder::new(transport)
    }

    pub(crate) fn from_parts(transport: T, errors: ErrorReporter) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                events: Arc::new(AsyncIdQueue::new()),
                controllers: Mutex::new(HashMap::new()),
                errors,
            }),
        }
    }

    /// Feed a message received from the client.
    ///
    /// Returns the message's id and, for a REQUEST, the request to handle.
    /// Answer it with [`response`](Self::response). The request's
    /// [`cancellation`](Request::cancellation) token fires when the client
    /// aborts; a streaming body arrives as [`Body::Stream`].
    ///
    /// # Errors
    ///
    /// [`PeerError::Decode`] if the message is malformed; other exchanges
    /// are unaffected.
    pub async fn message(&self, raw: EncodedMessage) -> Result<(String, Option<Request>)> {
        let (id, message) = decode_request_message(raw).await?;

        match message {
            RequestMessage::Abort => {
                self.close(
                    Some(&id),
                    Some(PeerError::aborted("client aborted the request")),
                    true,
                );
                Ok((id, None))
            }
            RequestMessage::Event(payload) => {
                if !self.inner.events.push(&id, payload) {
                    tracing::debug!(id = %id, "discarding event for a closed exchange");
                }
                Ok((id, None))
            }
            RequestMessage::Request(mut request) => {
                let controller = CancellationToken::new();
                match self.controllers().entry(id.clone()) {
                    Entry::Occupied(_) => {
                        return Err(PeerError::Decode(format!(
                            "duplicate request for open exchange {id}"
                        )));
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(controller.clone());
                    }
                }
                self.inner.events.open(&id);
                tracing::debug!(id = %id, method = %request.method, url = %request.url, "exchange opened");

                request.cancellation = Some(controller);
                if request.is_event_stream() {
                    request.body = Body::Stream(EventStream::from(self.request_stream(&id)));
                }
                Ok((id, Some(request)))
            }
        }
    }

    /// Feed a message and answer a REQUEST with `handler`.
    ///
    /// Returns the message's id. When the handler fails, the exchange is
    /// closed without notifying the client and the error is returned.
    pub async fn message_with_handler<F, Fut>(&self, raw: EncodedMessage, handler: F) -> Result<String>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Result<Response>>,
    {
        let (id, request) = self.message(raw).await?;
        let Some(request) = request else {
            return Ok(id);
        };

        match handler(request).await {
            Ok(response) => {
                self.response(&id, response).await?;
                Ok(id)
            }
            Err(err) => {
                tracing::debug!(id = %id, error = %err, "handler failed");
                self.close(Some(&id), Some(err.clone()), false);
                Err(err)
            }
        }
    }

    /// Send the response for exchange `id`, then close it.
    ///
    /// Does nothing when the exchange is closed or was aborted by the
    /// client. A streaming body is sent as EVENT_ITERATOR messages after
    /// the RESPONSE and stops early once the client aborts.
    ///
    /// # Errors
    ///
    /// Send failures and errors raised by the response stream; the exchange
    /// is closed with that error.
    pub async fn response(&self, id: &str, response: Response) -> Result<()> {
        let controller = self.controllers().get(id).cloned();
        let Some(controller) = controller.filter(|c| !c.is_cancelled()) else {
            tracing::debug!(id = %id, "dropping response for a closed exchange");
            return Ok(());
        };

        match self.send_response(id, response, &controller).await {
            Ok(()) => {
                self.close(Some(id), None, false);
                Ok(())
            }
            Err(err) => {
                self.close(Some(id), Some(err.clone()), false);
                Err(err)
            }
        }
    }

    async fn send_response(
        &self,
        id: &str,
        mut response: Response,
        controller: &CancellationToken,
    ) -> Result<()> {
        let message = encode_response(id, &response)?;
        let body = response.body.take_stream();
        self.inner.transport.send(message).await?;

        let Some(body) = body else {
            return Ok(());
        };
        let transport = &self.inner.transport;
        resolve_event_iterator(body, move |payload| async move {
            if controller.is_cancelled() {
                return Ok(Direction::Abort);
            }
            transport.send(encode_event(id, &payload)?).await?;
            Ok(Direction::Next)
        })
        .await
    }

    /// Consumer for a streaming request body.
    fn request_stream(&self, id: &str) -> EventIterator {
        let peer = self.clone();
        let stream_id = id.to_owned();
        EventIterator::new(self.inner.events.clone(), id, move |reason| async move {
            if reason.is_next() || !peer.inner.events.is_open(&stream_id) {
                return Ok(());
            }
            // Stop buffering chunks the handler will never read.
            peer.inner.events.close(Some(&stream_id), None);
            let result = match encode_abort(&stream_id) {
                Ok(message) => peer.inner.transport.send(message).await,
                Err(err) => Err(err),
            };
            if let Err(err) = &result {
                peer.inner.errors.report(&stream_id, "sending abort signal", err);
            }
            result
        })
    }

    /// Close exchange `id`, or every open exchange when `id` is `None`.
    ///
    /// With `abort`, the exchanges' cancellation tokens fire with `reason`.
    /// Streaming request bodies still being read fail with `reason`, or
    /// [`PeerError::Closed`] when none is given.
    pub fn close(&self, id: Option<&str>, reason: Option<PeerError>, abort: bool) {
        let closed: Vec<(String, CancellationToken)> = {
            let mut controllers = self.controllers();
            match id {
                Some(id) => controllers.remove_entry(id).into_iter().collect(),
                None => controllers.drain().collect(),
            }
        };

        for (id, controller) in &closed {
            if abort {
                controller.cancel(
                    reason
                        .clone()
                        .unwrap_or_else(|| PeerError::aborted("exchange closed")),
                );
            }
            tracing::debug!(id = %id, abort, "exchange closed");
        }

        self.inner.events.close(id, reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use http::{HeaderName, HeaderValue, StatusCode};
    use peerwire_core::{
        EventKind, EventValue, ResponseMessage, decode_response_message, encode_request, internal_url,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Sent = mpsc::UnboundedReceiver<EncodedMessage>;

    fn recording_peer() -> (ServerPeer<impl Transport>, Sent) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = move |message: EncodedMessage| {
            let result = tx
                .send(message)
                .map_err(|_| PeerError::transport("channel closed"));
            async move { result }
        };
        (ServerPeer::new(transport), rx)
    }

    async fn next_sent(sent: &mut Sent) -> (String, ResponseMessage) {
        let raw = tokio::time::timeout(Duration::from_secs(1), sent.recv())
            .await
            .expect("message sent in time")
            .expect("transport open");
        decode_response_message(raw).await.unwrap()
    }

    fn encoded_request(id: &str, path: &str, body: impl Into<Body>) -> EncodedMessage {
        let request = Request::new(internal_url(path).unwrap()).body(body);
        encode_request(id, &request).unwrap()
    }

    fn counting_stream(drops: Arc<AtomicUsize>) -> (mpsc::UnboundedSender<EventValue>, EventStream) {
        struct Finalizer(Arc<AtomicUsize>);
        impl Drop for Finalizer {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (tx, rx) = mpsc::unbounded_channel::<EventValue>();
        let finalizer = Finalizer(drops);
        let stream = futures::stream::unfold((rx, finalizer), |(mut rx, finalizer)| async move {
            rx.recv()
                .await
                .map(|value| (Ok::<_, PeerError>(value), (rx, finalizer)))
        });
        (tx, EventStream::new(stream))
    }

    #[tokio::test]
    async fn test_handler_response() {
        let (peer, mut sent) = recording_peer();
        let raw = encoded_request("1", "/planet/find", json!({"hello": "world"}));

        let id = peer
            .message_with_handler(raw, |request| async move {
                assert!(request.cancellation.is_some());
                let Some(body) = request.body.as_json() else {
                    return Err(PeerError::internal("expected json"));
                };
                Ok(Response::new(json!({"echo": body}))
                    .header(HeaderName::from_static("x-response"), HeaderValue::from_static("1")))
            })
            .await
            .unwrap();
        assert_eq!(id, "1");

        let (reply_id, message) = next_sent(&mut sent).await;
        assert_eq!(reply_id, "1");
        let ResponseMessage::Response(response) = message else {
            panic!("expected a response");
        };
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers["x-response"], "1");
        assert_eq!(
            response.body.as_json(),
            Some(&json!({"echo": {"hello": "world"}}))
        );
        assert!(peer.is_empty());
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_manual_response() {
        let (peer, mut sent) = recording_peer();
        let (id, request) = peer
            .message(encoded_request("a", "/x", Body::Empty))
            .await
            .unwrap();
        let request = request.unwrap();
        assert_eq!(request.url.path(), "/x");
        assert_eq!(peer.len(), 1);

        peer.response(&id, Response::new(json!(1)).status(StatusCode::CREATED))
            .await
            .unwrap();

        let (_, message) = next_sent(&mut sent).await;
        let ResponseMessage::Response(response) = message else {
            panic!("expected a response");
        };
        assert_eq!(response.status, StatusCode::CREATED);
        assert!(peer.is_empty());

        // A second response for the same id is dropped.
        peer.response(&id, Response::default()).await.unwrap();
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_streaming_response_order() {
        let (peer, mut sent) = recording_peer();
        let raw = encoded_request("1", "/feed", Body::Empty);

        peer.message_with_handler(raw, |_| async {
            let stream = EventStream::from_values(vec![
                EventValue::new(json!("a")),
                EventValue::new(json!("b")),
            ])
            .with_return(EventValue::new(json!("end")));
            Ok::<_, PeerError>(Response::new(stream))
        })
        .await
        .unwrap();

        let (_, first) = next_sent(&mut sent).await;
        let ResponseMessage::Response(response) = first else {
            panic!("RESPONSE must come first");
        };
        assert!(response.is_event_stream());

        let mut events = Vec::new();
        for _ in 0..3 {
            match next_sent(&mut sent).await {
                (_, ResponseMessage::Event(payload)) => events.push(payload),
                (_, other) => panic!("expected an event, got {other:?}"),
            }
        }
        assert_eq!(events[0].data, Some(json!("a")));
        assert_eq!(events[1].data, Some(json!("b")));
        assert_eq!(events[2].event, EventKind::Done);
        assert_eq!(events[2].data, Some(json!("end")));
        assert!(peer.is_empty());
    }

    #[tokio::test]
    async fn test_client_abort_stops_response_stream() {
        let (peer, mut sent) = recording_peer();
        let drops = Arc::new(AtomicUsize::new(0));
        let (chunks, stream) = counting_stream(drops.clone());

        let handling = tokio::spawn({
            let peer = peer.clone();
            async move {
                peer.message_with_handler(encoded_request("1", "/feed", Body::Empty), |_| async {
                    Ok::<_, PeerError>(Response::new(stream))
                })
                .await
            }
        });

        assert!(matches!(next_sent(&mut sent).await.1, ResponseMessage::Response(_)));
        chunks.send(EventValue::new(json!(1))).unwrap();
        assert!(matches!(next_sent(&mut sent).await.1, ResponseMessage::Event(_)));

        peer.message(encode_abort("1").unwrap()).await.unwrap();
        let _ = chunks.send(EventValue::new(json!(2)));

        handling.await.unwrap().unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(sent.try_recv().is_err());
        assert!(peer.is_empty());
    }

    #[tokio::test]
    async fn test_abort_cancels_handler_token() {
        let (peer, mut sent) = recording_peer();
        let (_, request) = peer
            .message(encoded_request("1", "/slow", Body::Empty))
            .await
            .unwrap();
        let token = request.unwrap().cancellation.unwrap();

        peer.message(encode_abort("1").unwrap()).await.unwrap();

        let reason = token.cancelled().await;
        assert_eq!(reason.to_string(), "aborted: client aborted the request");
        assert!(peer.is_empty());

        peer.response("1", Response::new(json!("late"))).await.unwrap();
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_request_keeps_first_exchange() {
        let (peer, mut sent) = recording_peer();
        let (_, request) = peer
            .message(encoded_request("1", "/slow", Body::Empty))
            .await
            .unwrap();
        let token = request.unwrap().cancellation.unwrap();

        let err = peer
            .message(encoded_request("1", "/other", Body::Empty))
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Decode(_)));
        assert_eq!(peer.len(), 1);
        assert!(format!("{peer:?}").contains("open: 1"));

        peer.message(encode_abort("1").unwrap()).await.unwrap();
        assert!(token.is_cancelled());
        assert!(peer.is_empty());
        assert!(format!("{peer:?}").contains("open: 0"));
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_failure_closes_without_response() {
        let (peer, mut sent) = recording_peer();
        let err = peer
            .message_with_handler(encoded_request("1", "/x", Body::Empty), |_| async {
                Err::<Response, _>(PeerError::internal("handler exploded"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PeerError::Internal(_)));
        assert!(peer.is_empty());
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_streaming_request_body() {
        let (peer, mut sent) = recording_peer();
        let body = EventStream::from_values(Vec::new());
        let (id, request) = peer
            .message(encoded_request("1", "/upload", body))
            .await
            .unwrap();
        let mut request = request.unwrap();
        assert!(request.body.is_stream());

        for n in [1, 2] {
            let event = EventPayload::message(EventValue::new(json!(n)));
            peer.message(encode_event(&id, &event).unwrap()).await.unwrap();
        }
        peer.message(encode_event(&id, &EventPayload::done(None)).unwrap())
            .await
            .unwrap();

        let values: Vec<_> = request
            .body
            .take_stream()
            .unwrap()
            .map(|item| item.unwrap().into_data())
            .collect()
            .await;
        assert_eq!(values, [json!(1), json!(2)]);

        peer.response(&id, Response::default()).await.unwrap();
        assert!(matches!(next_sent(&mut sent).await.1, ResponseMessage::Response(_)));
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_abandoned_request_body_aborts_client() {
        let (peer, mut sent) = recording_peer();
        let (id, request) = peer
            .message(encoded_request("1", "/upload", EventStream::from_values(Vec::new())))
            .await
            .unwrap();
        let body = request.unwrap().body.into_stream().unwrap();

        body.abort().await.unwrap();

        let (abort_id, message) = next_sent(&mut sent).await;
        assert_eq!(abort_id, id);
        assert!(matches!(message, ResponseMessage::Abort));

        // The exchange stays open for the response.
        assert_eq!(peer.len(), 1);
        let event = EventPayload::message(EventValue::new(json!("late")));
        peer.message(encode_event(&id, &event).unwrap()).await.unwrap();
        peer.response(&id, Response::default()).await.unwrap();
        assert!(matches!(next_sent(&mut sent).await.1, ResponseMessage::Response(_)));
    }

    #[tokio::test]
    async fn test_response_stream_error_is_returned() {
        let (peer, mut sent) = recording_peer();
        let err = peer
            .message_with_handler(encoded_request("1", "/feed", Body::Empty), |_| async {
                let stream = EventStream::new(futures::stream::iter(vec![
                    Ok(EventValue::new(json!(1))),
                    Err(PeerError::internal("db connection lost")),
                ]));
                Ok::<_, PeerError>(Response::new(stream))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PeerError::Internal(_)));

        assert!(matches!(next_sent(&mut sent).await.1, ResponseMessage::Response(_)));
        assert!(matches!(next_sent(&mut sent).await.1, ResponseMessage::Event(_)));
        match next_sent(&mut sent).await.1 {
            ResponseMessage::Event(payload) => {
                assert_eq!(payload.event, EventKind::Error);
                assert!(payload.data.is_none());
            }
            other => panic!("expected an error event, got {other:?}"),
        }
        assert!(peer.is_empty());
    }

    #[tokio::test]
    async fn test_close_all() {
        let (peer, _sent) = recording_peer();
        let mut tokens = Vec::new();
        for id in ["1", "2", "3"] {
            let (_, request) = peer
                .message(encoded_request(id, "/x", Body::Empty))
                .await
                .unwrap();
            tokens.push(request.unwrap().cancellation.unwrap());
        }

        peer.close(None, Some(PeerError::aborted("shutting down")), true);

        assert!(peer.is_empty());
        for token in tokens {
            assert!(token.is_cancelled());
        }
    }

    #[tokio::test]
    async fn test_decode_error() {
        let (peer, _sent) = recording_peer();
        let err = peer.message(EncodedMessage::from("[]")).await.unwrap_err();
        assert!(matches!(err, PeerError::Decode(_)));
    }
}
