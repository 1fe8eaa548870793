//! Paged ring allocator.
//!
//! Owns the in-memory page ring mapped onto the log's logical address space,
//! issues tail-monotonic addresses to producers, flushes closed regions to
//! the storage device in the background, and reports each durable advance to
//! the commit coordinator.

pub mod flush;
pub mod ring;

pub use ring::{LogAllocator, LogGeometry};
