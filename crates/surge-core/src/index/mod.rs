//! Concurrency-safe multi-key indexes.
//!
//! Three shapes, one discipline: a forward map and (where applicable) a
//! reverse map kept mutually consistent under a single reader/writer lock.
//! Reads run concurrently, writes are exclusive, and no lock is ever held
//! across I/O. Each index is generic over its concrete domain types and
//! instantiated per use site.

mod owner;
mod pair;
mod set;

pub use owner::OwnerIndex;
pub use pair::PairIndex;
pub use set::SetIndex;
