//! Endpoint-side library for the seam data mesh.
//!
//! A [`Client`] engine manages one QUIC session to a zipper: it opens and
//! authenticates the control stream, handshakes a data stream, pumps
//! frames in both directions, and reconnects with a fixed backoff when
//! the network fails. [`Source`] and [`StreamFunction`] wrap the engine
//! with the producer and handler surfaces.
//!
//! # Typical flow
//!
//! 1. Build an iroh `Endpoint` and a [`ClientOptions`].
//! 2. Construct a [`Source`] or [`StreamFunction`] with the zipper's
//!    base58 address.
//! 3. Install handlers, then `connect`.
//! 4. Sources `write`/`broadcast`/`pipe`; stream functions `wait`.

#![warn(clippy::pedantic)]

pub(crate) mod client;
pub(crate) mod control;
pub(crate) mod options;
pub(crate) mod peer;
pub(crate) mod serverless;
pub(crate) mod sfn;
pub(crate) mod source;

pub use client::Client;
pub use control::ClientControlStream;
pub use options::ClientOptions;
pub use peer::Peer;
pub use serverless::{Context, Payload};
pub use sfn::StreamFunction;
pub use source::Source;
