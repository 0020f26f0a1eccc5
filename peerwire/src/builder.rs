//! Server peer builder.

use std::sync::Arc;

use peerwire_core::{ErrorHandler, ErrorReporter, PeerError, Transport};

use crate::peer::ServerPeer;

/// Builder for creating a [`ServerPeer`].
///
/// # Example
///
/// ```ignore
/// use peerwire::ServerPeer;
///
/// let peer = ServerPeer::builder(transport)
///     .on_error(|err| tracing::error!(%err, "peer failure"))
///     .build();
/// ```
pub struct ServerPeerBuilder<T> {
    transport: T,
    on_error: Option<ErrorHandler>,
}

impl<T> std::fmt::Debug for ServerPeerBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerPeerBuilder")
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl<T: Transport> ServerPeerBuilder<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            on_error: None,
        }
    }

    /// Receive failures that happen off the caller's path, such as an
    /// ABORT_SIGNAL that could not be sent after a handler stopped reading
    /// a streaming request body. They are logged either way.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PeerError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> ServerPeer<T> {
        ServerPeer::from_parts(self.transport, ErrorReporter::new(self.on_error))
    }
}
