//! Typed protocol messages.
//!
//! These are the values the peers exchange before encoding and after
//! decoding: [`Request`], [`Response`], [`EventPayload`], plus the body
//! variants a request or response can carry.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::cancel::CancellationToken;
use crate::error::{ErrorEvent, PeerError, Result};
use crate::event::{EventStream, EventValue};

/// Placeholder origin for requests that never leave the peer channel.
///
/// URLs under this origin are shortened to their path on the wire.
pub const INTERNAL_ORIGIN: &str = "orpc://localhost";

/// Content type marking a body that travels as EVENT_ITERATOR messages.
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Content type of query-encoded bodies.
pub const FORM_URLENCODED_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Content type prefix of multipart bodies.
pub const MULTIPART_CONTENT_TYPE: &str = "multipart/form-data";

/// Wire message type tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Request = 1,
    Response = 2,
    EventIterator = 3,
    AbortSignal = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = PeerError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Response),
            3 => Ok(MessageType::EventIterator),
            4 => Ok(MessageType::AbortSignal),
            other => Err(PeerError::Decode(format!("unknown message type: {other}"))),
        }
    }
}

/// A message as handed to (or received from) the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EncodedMessage {
    /// Plain JSON text.
    Text(String),
    /// JSON header, a `0xFF` separator, then raw payload bytes.
    Binary(Bytes),
}

impl EncodedMessage {
    /// Returns whether the message is binary framed.
    pub fn is_binary(&self) -> bool {
        matches!(self, EncodedMessage::Binary(_))
    }

    /// Get the text content, if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            EncodedMessage::Text(text) => Some(text),
            EncodedMessage::Binary(_) => None,
        }
    }
}

impl From<String> for EncodedMessage {
    fn from(text: String) -> Self {
        EncodedMessage::Text(text)
    }
}

impl From<&str> for EncodedMessage {
    fn from(text: &str) -> Self {
        EncodedMessage::Text(text.to_owned())
    }
}

impl From<Bytes> for EncodedMessage {
    fn from(bytes: Bytes) -> Self {
        EncodedMessage::Binary(bytes)
    }
}

impl From<Vec<u8>> for EncodedMessage {
    fn from(bytes: Vec<u8>) -> Self {
        EncodedMessage::Binary(Bytes::from(bytes))
    }
}

/// Per-value stream hints: resume id, reconnect delay and comments.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<String>,
}

impl EventMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn retry(mut self, retry_ms: u64) -> Self {
        self.retry = Some(retry_ms);
        self
    }

    pub fn comment<S: Into<String>>(mut self, comment: S) -> Self {
        self.comments.push(comment.into());
        self
    }

    /// Returns whether no hint is set.
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.retry.is_none() && self.comments.is_empty()
    }
}

/// Stream event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Message,
    Error,
    Done,
}

/// One stream chunk as carried by an EVENT_ITERATOR message.
#[derive(Clone, Debug, PartialEq)]
pub struct EventPayload {
    pub event: EventKind,
    pub data: Option<Value>,
    pub meta: Option<EventMeta>,
}

impl EventPayload {
    /// A `message` event for a produced value.
    pub fn message(value: EventValue) -> Self {
        let (data, meta) = value.into_parts();
        Self {
            event: EventKind::Message,
            data: Some(data),
            meta,
        }
    }

    /// A `done` event carrying the producer's final value, if any.
    pub fn done(value: Option<EventValue>) -> Self {
        match value {
            Some(value) => {
                let (data, meta) = value.into_parts();
                Self {
                    event: EventKind::Done,
                    data: Some(data),
                    meta,
                }
            }
            None => Self {
                event: EventKind::Done,
                data: None,
                meta: None,
            },
        }
    }

    /// An `error` event for a producer failure.
    ///
    /// Only [`PeerError::Event`] forwards its data and meta.
    pub fn error(err: &PeerError) -> Self {
        match err.as_event() {
            Some(event) => Self {
                event: EventKind::Error,
                data: event.data().cloned(),
                meta: event.meta().cloned(),
            },
            None => Self {
                event: EventKind::Error,
                data: None,
                meta: None,
            },
        }
    }

    pub(crate) fn into_value(self) -> EventValue {
        let value = EventValue::new(self.data.unwrap_or(Value::Null));
        match self.meta {
            Some(meta) => value.with_meta(meta),
            None => value,
        }
    }

    pub(crate) fn into_error(self) -> PeerError {
        PeerError::Event(ErrorEvent::from_parts(self.data, self.meta))
    }
}

/// A binary object, optionally named (a file).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Blob {
    content_type: String,
    name: Option<String>,
    data: Bytes,
}

impl Blob {
    /// Create an unnamed blob.
    pub fn new<S: Into<String>, B: Into<Bytes>>(content_type: S, data: B) -> Self {
        Self {
            content_type: content_type.into(),
            name: None,
            data: data.into(),
        }
    }

    /// Create a named blob.
    pub fn file<N, S, B>(name: N, content_type: S, data: B) -> Self
    where
        N: Into<String>,
        S: Into<String>,
        B: Into<Bytes>,
    {
        Self {
            content_type: content_type.into(),
            name: Some(name.into()),
            data: data.into(),
        }
    }

    pub fn with_name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A multipart form field value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FormValue {
    Text(String),
    File(Blob),
}

/// A multipart form: ordered named fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FormData {
    fields: Vec<(String, FormValue)>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a text field.
    pub fn text<N: Into<String>, V: Into<String>>(mut self, name: N, value: V) -> Self {
        self.append(name, FormValue::Text(value.into()));
        self
    }

    /// Append a file field.
    pub fn file<N: Into<String>>(mut self, name: N, blob: Blob) -> Self {
        self.append(name, FormValue::File(blob));
        self
    }

    pub fn append<N: Into<String>>(&mut self, name: N, value: FormValue) {
        self.fields.push((name.into(), value));
    }

    /// Get the first field with the given name.
    pub fn get(&self, name: &str) -> Option<&FormValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FormValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A query-encoded (`application/x-www-form-urlencoded`) key/value payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a query string (without the leading `?`).
    pub fn parse(input: &str) -> Self {
        Self {
            pairs: url::form_urlencoded::parse(input.as_bytes())
                .into_owned()
                .collect(),
        }
    }

    pub fn append<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    /// Get the first value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl std::fmt::Display for QueryParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.pairs.iter())
            .finish();
        f.write_str(&encoded)
    }
}

/// A request or response body.
#[derive(Debug, Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// A structured JSON value.
    Json(Value),
    /// A binary object or named file.
    Blob(Blob),
    /// A multipart form.
    Form(FormData),
    /// A query-encoded key/value payload.
    Query(QueryParams),
    /// An incremental event stream.
    Stream(EventStream),
}

impl Body {
    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&Blob> {
        match self {
            Body::Blob(blob) => Some(blob),
            _ => None,
        }
    }

    pub fn as_form(&self) -> Option<&FormData> {
        match self {
            Body::Form(form) => Some(form),
            _ => None,
        }
    }

    pub fn as_query(&self) -> Option<&QueryParams> {
        match self {
            Body::Query(query) => Some(query),
            _ => None,
        }
    }

    /// Take the stream out of a stream body, leaving [`Body::Empty`].
    ///
    /// Non-stream bodies are left untouched.
    pub fn take_stream(&mut self) -> Option<EventStream> {
        if !self.is_stream() {
            return None;
        }
        match std::mem::take(self) {
            Body::Stream(stream) => Some(stream),
            _ => None,
        }
    }

    /// Consume the body, returning its stream if it is one.
    pub fn into_stream(self) -> Option<EventStream> {
        match self {
            Body::Stream(stream) => Some(stream),
            _ => None,
        }
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Body::Json(value)
    }
}

impl From<Blob> for Body {
    fn from(blob: Blob) -> Self {
        Body::Blob(blob)
    }
}

impl From<FormData> for Body {
    fn from(form: FormData) -> Self {
        Body::Form(form)
    }
}

impl From<QueryParams> for Body {
    fn from(query: QueryParams) -> Self {
        Body::Query(query)
    }
}

impl From<EventStream> for Body {
    fn from(stream: EventStream) -> Self {
        Body::Stream(stream)
    }
}

/// Returns whether `headers` mark the body as an event stream.
///
/// A `content-disposition` header wins: such a body is a file that happens
/// to have an event-stream content type.
pub fn is_event_stream_headers(headers: &HeaderMap) -> bool {
    let is_stream_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(EVENT_STREAM_CONTENT_TYPE));
    is_stream_type && !headers.contains_key(header::CONTENT_DISPOSITION)
}

/// Build a URL under [`INTERNAL_ORIGIN`].
pub fn internal_url(path: &str) -> Result<Url> {
    let path = path.strip_prefix('/').unwrap_or(path);
    Url::parse(&format!("{INTERNAL_ORIGIN}/{path}"))
        .map_err(|e| PeerError::Encode(format!("invalid request path {path:?}: {e}")))
}

/// A request exchanged between peers.
#[derive(Debug)]
pub struct Request {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Body,
    /// Cooperative cancellation for this exchange.
    ///
    /// Set by the caller on the client side; set by the server peer to the
    /// exchange's controller on the receiving side. Never encoded.
    pub cancellation: Option<CancellationToken>,
}

impl Request {
    /// Create a POST request without headers or body.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::POST,
            headers: HeaderMap::new(),
            body: Body::Empty,
            cancellation: None,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Append a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body<B: Into<Body>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Returns whether the headers mark the body as an event stream.
    pub fn is_event_stream(&self) -> bool {
        is_event_stream_headers(&self.headers)
    }
}

/// A response exchanged between peers.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Body::Empty,
        }
    }
}

impl Response {
    /// Create a 200 response with the given body.
    pub fn new<B: Into<Body>>(body: B) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Append a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn body<B: Into<Body>>(mut self, body: B) -> Self {
        self.body = body.into();
        self
    }

    /// Returns whether the headers mark the body as an event stream.
    pub fn is_event_stream(&self) -> bool {
        is_event_stream_headers(&self.headers)
    }
}
