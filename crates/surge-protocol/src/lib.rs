//! # surge-protocol
//!
//! Wire protocol types and framing for the Surge push backend.
//!
//! The protocol is line-of-sight JSON: every logical message is one JSON
//! object, and every physical frame is a JSON **array** of logical messages.
//! Clients send [`Request`] envelopes, the server answers with [`Response`]
//! envelopes, and server-originated pushes reuse the response shape under
//! the `rcvdata` command.
//!
//! ## Framing
//!
//! ```text
//! client → server   [ {"cmd":"login","seq":1,"data":{"uid":100}}, ... ]
//! server → client   [ {"cmd":"login","seq":1,"code":0,"data":{"id":7}}, ... ]
//! ```
//!
//! Batch *assembly* from pre-serialized frames is the transport layer's job;
//! this crate only defines the envelope types, the batch decoder, and the
//! error taxonomy with its wire codes.

pub mod commands;
pub mod envelope;
pub mod error;

pub use commands::{ConnectionId, UserId};
pub use envelope::{decode_batch, ProtocolError, Request, Response};
pub use error::PushError;
