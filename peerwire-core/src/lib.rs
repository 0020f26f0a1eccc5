//! Core protocol types for peerwire.
//!
//! This crate provides the types and functions shared by the server
//! (`peerwire`) and client (`peerwire-client`) peers.
//!
//! ## Modules
//!
//! - [`error`]: The protocol error type
//! - [`message`]: Requests, responses, bodies and stream payloads
//! - [`codec`]: Envelope encoding and binary framing
//! - [`multipart`]: Multipart forms and `content-disposition` values
//! - [`event`]: Bridge between event streams and wire messages
//! - [`queue`]: Per-id async FIFO queue
//! - [`cancel`]: Cancellation token
//! - [`id`]: Correlation id allocation
//! - [`transport`]: Outgoing message channel and out-of-band errors

pub mod cancel;
pub mod codec;
pub mod error;
pub mod event;
pub mod id;
pub mod message;
pub mod multipart;
pub mod queue;
pub mod transport;

pub use cancel::*;
pub use codec::*;
pub use error::*;
pub use event::*;
pub use id::*;
pub use message::*;
pub use queue::*;
pub use transport::*;
