//! Null storage device for testing.
//!
//! Discards all writes and returns zeros for reads. Useful for exercising
//! the in-memory append machinery without touching a file system.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::SyncStorageDevice;

/// A storage device that discards writes and reads back zeros.
pub struct NullDisk {
    /// Logical size of the device
    size: AtomicU64,
}

impl NullDisk {
    /// Create a new null disk
    pub fn new() -> Self {
        Self {
            size: AtomicU64::new(0),
        }
    }
}

impl Default for NullDisk {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStorageDevice for NullDisk {
    fn read_sync(&self, _offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let new_end = offset + buf.len() as u64;
        self.size.fetch_max(new_end, Ordering::AcqRel);
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        Ok(())
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.size.store(size, Ordering::Release);
        Ok(())
    }

    fn size_sync(&self) -> io::Result<u64> {
        Ok(self.size.load(Ordering::Acquire))
    }
}
