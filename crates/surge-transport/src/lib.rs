//! # surge-transport
//!
//! Duplex-session machinery for the Surge push backend.
//!
//! This crate owns everything between a decoded command and the socket:
//!
//! - **Wire** - capability trait over the raw duplex stream (send one
//!   physical frame, ping, close)
//! - **Client** - one live session: outbound batching queue, liveness flag,
//!   typed session state
//! - **ClientGroup / Deliver** - cardinality-agnostic delivery of a
//!   pre-serialized frame to one or many sessions
//! - **PumpPool** - fixed worker pool draining "ready to flush" clients
//!
//! ## Write path
//!
//! ```text
//! ┌─────────┐ enqueue  ┌──────────┐ ready  ┌──────────┐ flush ┌──────┐
//! │ handler │─────────▶│  Client  │───────▶│ PumpPool │──────▶│ Wire │
//! └─────────┘          └──────────┘        └──────────┘       └──────┘
//! ```
//!
//! Batched frames are flushed as one JSON array per physical frame, in
//! enqueue order. Immediate sends bypass the queue entirely.

pub mod client;
pub mod pump;
pub mod wire;

pub use client::{Client, ClientGroup, ClientHandle, Deliver};
pub use pump::PumpPool;
pub use wire::{pipe, PipeEvent, PipeWire, TransportError, Wire, WsWire};
