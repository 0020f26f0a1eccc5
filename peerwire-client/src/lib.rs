//! Client peer for the peerwire message protocol.
//!
//! This crate provides the requesting side of a peerwire channel, designed
//! to talk to a `peerwire` server peer over any ordered message transport
//! (in-process channels, sockets, worker ports).
//!
//! ## Features
//!
//! - Request/response calls multiplexed over one channel
//! - Streaming request bodies (sent as EVENT_ITERATOR messages)
//! - Streaming response bodies (consumed as a `Stream`)
//! - Cooperative cancellation in both directions
//! - Binary framing for blobs and multipart forms
//!
//! ## Example
//!
//! ```ignore
//! use peerwire_client::ClientPeer;
//! use peerwire_core::{Request, internal_url};
//! use serde_json::json;
//!
//! let peer = ClientPeer::builder(transport)
//!     .on_error(|err| eprintln!("background failure: {err}"))
//!     .build();
//!
//! let response = peer
//!     .request(Request::new(internal_url("/planet/find")?).body(json!({"name": "earth"})))
//!     .await?;
//! println!("Response: {:?}", response.body);
//! ```
//!
//! ## Streaming Example
//!
//! ```ignore
//! use futures::StreamExt;
//!
//! let response = peer.request(Request::new(internal_url("/feed")?)).await?;
//! let mut stream = response.body.into_stream().expect("streaming response");
//! while let Some(item) = stream.next().await {
//!     match item {
//!         Ok(value) => println!("Got: {:?}", value.data()),
//!         Err(e) => eprintln!("Error: {e}"),
//!     }
//! }
//! ```
//!
//! ## Cancellation
//!
//! - Attach a [`CancellationToken`](peerwire_core::CancellationToken) with
//!   [`Request::cancellation`](peerwire_core::Request::cancellation) and
//!   cancel it: an ABORT_SIGNAL is sent and the call fails with the reason.
//! - Drop a streaming response body before it ends: an ABORT_SIGNAL is
//!   sent and the exchange is closed.
//! - Call [`ClientPeer::close`] to fail pending exchanges locally without
//!   telling the server, e.g. when the transport went away.

mod builder;
mod peer;

pub use builder::ClientPeerBuilder;
pub use peer::ClientPeer;

// Re-export core types for convenience
pub use peerwire_core::{
    Body, CancellationToken, EncodedMessage, EventStream, EventValue, PeerError, Request,
    Response, Result, Transport,
};
