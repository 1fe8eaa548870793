//! Storage devices backing the log.
//!
//! The allocator owns a device and is its only writer; the read path and
//! scan iterators issue reads through the same device. A byte's device
//! offset equals its logical address.

pub mod file_device;
pub mod null_device;
pub mod traits;

pub use file_device::{FileSystemDisk, FileSystemFile, SegmentedFile};
pub use null_device::NullDisk;
pub use traits::{StorageDevice, SyncStorageDevice};
