//! Client peer builder.
//!
//! Provides a fluent API for configuring and building a [`ClientPeer`].

use std::sync::Arc;

use peerwire_core::{ErrorHandler, ErrorReporter, IdGenerator, PeerError, SequentialIdGenerator, Transport};

use crate::peer::ClientPeer;

/// Builder for creating a [`ClientPeer`].
///
/// # Example
///
/// ```ignore
/// use peerwire_client::ClientPeer;
///
/// let peer = ClientPeer::builder(transport)
///     .on_error(|err| eprintln!("peer error: {err}"))
///     .build();
/// ```
pub struct ClientPeerBuilder<T> {
    transport: T,
    /// Allocator for correlation ids.
    ids: Option<Arc<dyn IdGenerator>>,
    /// Hook for failures no caller is waiting on.
    on_error: Option<ErrorHandler>,
}

impl<T> std::fmt::Debug for ClientPeerBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPeerBuilder")
            .field("ids", &self.ids.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

impl<T: Transport> ClientPeerBuilder<T> {
    /// Create a builder sending through `transport`.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            ids: None,
            on_error: None,
        }
    }

    /// Use a custom correlation id allocator.
    ///
    /// Defaults to [`SequentialIdGenerator`].
    pub fn id_generator<G: IdGenerator>(mut self, generator: G) -> Self {
        self.ids = Some(Arc::new(generator));
        self
    }

    /// Receive failures that happen off the caller's path.
    ///
    /// These are a lost ABORT_SIGNAL, a failed request stream chunk, or an
    /// error raised by the request body stream itself. They are logged
    /// either way.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PeerError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> ClientPeer<T> {
        ClientPeer::from_parts(
            self.transport,
            self.ids
                .unwrap_or_else(|| Arc::new(SequentialIdGenerator::new())),
            ErrorReporter::new(self.on_error),
        )
    }
}
