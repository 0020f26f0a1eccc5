//! The channel a peer sends encoded messages through, and the out-of-band
//! error channel for failures no caller is waiting on.

use std::future::Future;
use std::sync::Arc;

use crate::error::{PeerError, Result};
use crate::message::EncodedMessage;

/// An ordered, reliable, already-connected message channel.
///
/// Any `Fn(EncodedMessage) -> impl Future<Output = Result<()>>` closure is
/// a transport.
///
/// # Example
///
/// ```
/// use peerwire_core::{EncodedMessage, Result, Transport};
///
/// fn assert_transport<T: Transport>(_: &T) {}
///
/// let send = |message: EncodedMessage| async move {
///     println!("{message:?}");
///     Ok::<(), peerwire_core::PeerError>(())
/// };
/// assert_transport(&send);
/// ```
pub trait Transport: Send + Sync + 'static {
    /// Send one message. Resolves once the channel accepted it.
    fn send(&self, message: EncodedMessage) -> impl Future<Output = Result<()>> + Send;
}

impl<F, Fut> Transport for F
where
    F: Fn(EncodedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    fn send(&self, message: EncodedMessage) -> impl Future<Output = Result<()>> + Send {
        self(message)
    }
}

/// Hook receiving failures that happen off the caller's path, such as a
/// lost ABORT_SIGNAL or a failed stream chunk.
pub type ErrorHandler = Arc<dyn Fn(&PeerError) + Send + Sync>;

/// Out-of-band error channel of a peer.
///
/// Every report is logged with `tracing::warn!` and forwarded to the
/// optional [`ErrorHandler`].
#[derive(Clone, Default)]
pub struct ErrorReporter {
    hook: Option<ErrorHandler>,
}

impl ErrorReporter {
    pub fn new(hook: Option<ErrorHandler>) -> Self {
        Self { hook }
    }

    /// Report a failure for exchange `id` that occurred while doing `action`.
    pub fn report(&self, id: &str, action: &str, err: &PeerError) {
        tracing::warn!(id = %id, error = %err, "{action} failed");
        if let Some(hook) = &self.hook {
            hook(err);
        }
    }
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("hook", &self.hook.is_some())
            .finish()
    }
}
