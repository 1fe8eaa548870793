//! pagelog - A high-performance persistent append-only log
//!
//! This crate provides a durable record store optimized for concurrent
//! producers writing variable-length byte entries:
//!
//! - Lock-free bump-pointer appends into a paged circular buffer
//! - Epoch-based memory reclamation on the hot path
//! - Asynchronous page flushing with explicit commit boundaries
//! - Tail-following scans and random-address reads of committed records
//! - Prefix truncation and restore-on-open from commit metadata
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use pagelog::{PageLog, PageLogConfig, LocalCommitManager};
//! use pagelog::device::FileSystemDisk;
//!
//! let device = FileSystemDisk::single_file("data.log")?;
//! let commits = Box::new(LocalCommitManager::new("data.commit")?);
//! let log = PageLog::open(PageLogConfig::default(), device, commits)?;
//!
//! let addr = log.enqueue(b"payload")?;
//! log.commit(true)?;
//! ```

#![warn(missing_docs)]

pub mod address;
pub mod allocator;
pub mod commit;
pub mod device;
pub mod epoch;
pub mod log;
pub mod record;
pub mod status;
mod utility;

// Re-exports for convenience
pub use address::{Address, AtomicAddress};
pub use commit::{CommitManager, CommitMetadata, LocalCommitManager, MemoryCommitManager};
pub use log::{LogStats, PageLog, PageLogConfig, ScanBuffering};
pub use status::Status;

/// Constants used throughout the library
pub mod constants {
    use crate::address::Address;

    /// Size of a cache line in bytes
    pub const CACHE_LINE_BYTES: usize = 64;

    /// Maximum number of threads supported by the epoch manager
    pub const MAX_THREADS: usize = 96;

    /// First logical address the allocator hands out.
    ///
    /// Address 0 is reserved as the allocation-failure sentinel, so the log
    /// begins one cache line into the address space. Device offsets equal
    /// logical addresses; bytes below this constant are never written.
    pub const FIRST_VALID_ADDRESS: Address = Address::from_control(64);
}

/// Utility for size literals (e.g., 1_GiB)
pub mod size {
    /// 1 KiB in bytes
    pub const KIB: u64 = 1024;
    /// 1 MiB in bytes
    pub const MIB: u64 = 1024 * KIB;
    /// 1 GiB in bytes
    pub const GIB: u64 = 1024 * MIB;
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::address::{Address, AtomicAddress};
    pub use crate::commit::{CommitManager, LocalCommitManager};
    pub use crate::device::{FileSystemDisk, NullDisk, StorageDevice};
    pub use crate::log::{PageLog, PageLogConfig, ScanBuffering};
    pub use crate::status::Status;
}
