//! Peer protocol error types.
//!
//! This module provides the error types shared by both peers:
//! - [`PeerError`]: Every failure an exchange can end with
//! - [`ErrorEvent`]: Structured error data carried by an `error` stream event

use serde_json::Value;

use crate::message::EventMeta;

/// Structured error data carried across the wire by an `error` event.
///
/// A producer that fails with [`PeerError::Event`] has its `data` and `meta`
/// forwarded to the remote consumer verbatim. Any other failure is sent
/// as an `error` event without data, so internal details never leave the
/// producing peer.
///
/// # Example
///
/// ```
/// use peerwire_core::{ErrorEvent, PeerError};
/// use serde_json::json;
///
/// let err = PeerError::from(ErrorEvent::new(json!({"code": "NOT_FOUND"})));
/// assert!(err.is_event());
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ErrorEvent {
    data: Option<Value>,
    meta: Option<EventMeta>,
}

impl ErrorEvent {
    /// Create an error event carrying `data`.
    pub fn new(data: Value) -> Self {
        Self {
            data: Some(data),
            meta: None,
        }
    }

    /// Create an error event without data.
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(data: Option<Value>, meta: Option<EventMeta>) -> Self {
        Self { data, meta }
    }

    /// Attach event meta (id, retry, comments).
    pub fn with_meta(mut self, meta: EventMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Get the error data, if any.
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Get the event meta, if any.
    pub fn meta(&self) -> Option<&EventMeta> {
        self.meta.as_ref()
    }
}

impl std::fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            Some(data) => write!(f, "event stream error: {data}"),
            None => write!(f, "event stream error"),
        }
    }
}

/// Peer protocol error variants.
///
/// The type is `Clone` because a single close reason is delivered to every
/// waiter of an exchange (response slot, event lane, cancellation token).
#[derive(Clone, Debug, thiserror::Error)]
pub enum PeerError {
    /// Message encoding error.
    #[error("encode error: {0}")]
    Encode(String),

    /// Message decoding error (malformed envelope, truncated frame, etc.).
    #[error("decode error: {0}")]
    Decode(String),

    /// The transport failed to send a message.
    #[error("transport error: {0}")]
    Transport(String),

    /// The exchange was closed deliberately while something waited on it.
    #[error("exchange {id} was closed")]
    Closed { id: String },

    /// The exchange is not open (never opened, already closed or aborted).
    #[error("exchange {id} is not open")]
    NotOpen { id: String },

    /// The exchange was cancelled, locally or by the remote peer.
    #[error("aborted: {0}")]
    Aborted(String),

    /// Structured error received from (or sent to) an event stream.
    #[error("{0}")]
    Event(ErrorEvent),

    /// Any other failure, typically raised by a request handler or a
    /// stream producer.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PeerError {
    /// Create an aborted error with a reason.
    pub fn aborted<S: Into<String>>(reason: S) -> Self {
        PeerError::Aborted(reason.into())
    }

    /// Create an internal error with a message.
    pub fn internal<S: Into<String>>(message: S) -> Self {
        PeerError::Internal(message.into())
    }

    /// Create a transport error with a message.
    pub fn transport<S: Into<String>>(message: S) -> Self {
        PeerError::Transport(message.into())
    }

    /// Returns whether this error closed an exchange deliberately, as
    /// opposed to cancelling it.
    pub fn is_closed(&self) -> bool {
        matches!(self, PeerError::Closed { .. })
    }

    /// Returns whether this error is a cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, PeerError::Aborted(_))
    }

    /// Returns whether this error carries structured event data.
    pub fn is_event(&self) -> bool {
        matches!(self, PeerError::Event(_))
    }

    /// Get the structured event error, if this is one.
    pub fn as_event(&self) -> Option<&ErrorEvent> {
        match self {
            PeerError::Event(event) => Some(event),
            _ => None,
        }
    }
}

impl From<ErrorEvent> for PeerError {
    fn from(event: ErrorEvent) -> Self {
        PeerError::Event(event)
    }
}

impl From<serde_json::Error> for PeerError {
    fn from(err: serde_json::Error) -> Self {
        PeerError::Decode(format!("invalid JSON: {err}"))
    }
}

impl From<multer::Error> for PeerError {
    fn from(err: multer::Error) -> Self {
        PeerError::Decode(format!("invalid multipart body: {err}"))
    }
}

/// Result type alias using [`PeerError`].
pub type Result<T, E = PeerError> = std::result::Result<T, E>;
