//! # peerwire
//!
//! Request/response calls, cancellation and bidirectional streaming over
//! any ordered, reliable message channel: in-process channels, sockets,
//! worker ports.
//!
//! This crate provides the serving side ([`ServerPeer`]) and re-exports
//! the shared protocol types from `peerwire-core`. The requesting side
//! lives in `peerwire-client`.
//!
//! ## Features
//!
//! - **Multiplexing:** many concurrent exchanges over one channel, each
//!   tagged with a correlation id.
//! - **Streaming:** request and response bodies can be event streams,
//!   carried as EVENT_ITERATOR messages with one-chunk backpressure.
//! - **Cancellation:** either side can abort an exchange; handlers observe
//!   it through [`Request::cancellation`].
//! - **Binary framing:** blobs and multipart forms travel as raw bytes
//!   after a `0xFF` separator instead of being embedded in JSON.
//!
//! ## Getting Started
//!
//! ```ignore
//! use peerwire::prelude::*;
//!
//! let peer = ServerPeer::new(transport);
//! while let Some(raw) = incoming.recv().await {
//!     // Dispatch in arrival order; only the handler runs concurrently.
//!     let Ok((id, Some(request))) = peer.message(raw).await else {
//!         continue;
//!     };
//!     let peer = peer.clone();
//!     tokio::spawn(async move {
//!         let echo = request.body.as_json().cloned().unwrap_or_default();
//!         peer.response(&id, Response::new(echo)).await
//!     });
//! }
//! ```

pub mod builder;
pub mod peer;

pub use builder::ServerPeerBuilder;
pub use peer::ServerPeer;

pub use peerwire_core::*;

// Re-export several crates
pub use futures;
pub use http;
pub use serde_json;

pub mod prelude {
    //! A prelude for `peerwire` providing the most common types.
    pub use crate::builder::ServerPeerBuilder;
    pub use crate::peer::ServerPeer;
    pub use peerwire_core::{
        Blob, Body, CancellationToken, EncodedMessage, ErrorEvent, EventMeta, EventStream,
        EventValue, FormData, PeerError, QueryParams, Request, Response, Transport, internal_url,
    };
}
