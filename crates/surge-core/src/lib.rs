//! # surge-core
//!
//! Connection registry and delivery engine for the Surge push backend.
//!
//! This crate provides the addressable session directory and the
//! distributed presence layer:
//!
//! - **PairIndex** - bijective connection-id ↔ connection mapping
//! - **SetIndex** - bidirectional connection ↔ channel membership
//! - **OwnerIndex** - user → connections with reverse lookup
//! - **Room** - composes the indexes into the addressing directory
//! - **Distributor** - lease-backed presence entries in an external store
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │   handler   │────▶│    Room     │────▶│ ClientGroup  │
//! └─────────────┘     └─────────────┘     └──────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐     ┌──────────────┐
//!                     │ Distributor │────▶│  LeaseStore  │
//!                     └─────────────┘     └──────────────┘
//! ```
//!
//! All resolution through the [`Room`] is process-local; cross-node
//! resolution goes through the presence directory published by the
//! [`Distributor`](presence::Distributor).

pub mod index;
pub mod presence;
pub mod room;

pub use index::{OwnerIndex, PairIndex, SetIndex};
pub use presence::{
    resolve_nodes, DistributeError, Distributor, DistributorConfig, DistributorHandle, LeaseId,
    LeaseStore, MemoryLeaseStore, StoreError,
};
pub use room::{Room, RoomStats};
