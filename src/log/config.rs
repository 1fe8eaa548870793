//! Log configuration and statistics.

use std::fmt;

use crate::address::Address;
use crate::status::Status;
use crate::utility::is_power_of_two;

/// Configuration for a [`PageLog`](crate::PageLog)
#[derive(Debug, Clone)]
pub struct PageLogConfig {
    /// Page size in bytes (power of two, at least 512)
    pub page_size: usize,
    /// Number of pages in memory (at least 2)
    pub memory_pages: u32,
    /// Segment size for segmented disk storage
    pub segment_size: u64,
    /// Auto-commit interval in milliseconds (0 = disabled)
    pub auto_commit_ms: u64,
}

impl PageLogConfig {
    /// Create a configuration from a total memory budget and page size
    pub fn new(memory_size: u64, page_size: usize) -> Self {
        let memory_pages = (memory_size / page_size as u64) as u32;

        Self {
            page_size,
            memory_pages,
            segment_size: 1 << 30,
            auto_commit_ms: 0,
        }
    }

    /// Enable auto-commit at the given interval
    pub fn with_auto_commit_ms(mut self, interval_ms: u64) -> Self {
        self.auto_commit_ms = interval_ms;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), Status> {
        if !is_power_of_two(self.page_size as u64)
            || self.page_size < 512
            || self.page_size > (1 << 30)
        {
            return Err(Status::InvalidArgument);
        }
        if self.memory_pages < 2 {
            return Err(Status::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for PageLogConfig {
    fn default() -> Self {
        Self {
            page_size: 1 << 22, // 4 MB
            memory_pages: 64,
            segment_size: 1 << 30,
            auto_commit_ms: 0,
        }
    }
}

/// Snapshot of the log's watermarks and geometry
#[derive(Debug, Clone)]
pub struct LogStats {
    /// Oldest logically retained address
    pub begin_address: Address,
    /// Oldest address guaranteed retained across restart
    pub committed_begin_address: Address,
    /// Exclusive upper bound of committed bytes
    pub committed_until_address: Address,
    /// Exclusive upper bound of bytes durable on the device
    pub flushed_until_address: Address,
    /// Next address the allocator will hand out
    pub tail_address: Address,
    /// Page size in bytes
    pub page_size: usize,
    /// Number of pages in memory
    pub buffer_pages: u32,
}

impl fmt::Display for LogStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PageLog statistics:")?;
        writeln!(f, "  Begin: {}", self.begin_address)?;
        writeln!(f, "  Committed begin: {}", self.committed_begin_address)?;
        writeln!(f, "  Committed until: {}", self.committed_until_address)?;
        writeln!(f, "  Flushed until: {}", self.flushed_until_address)?;
        writeln!(f, "  Tail: {}", self.tail_address)?;
        writeln!(f, "  Page size: {} bytes", self.page_size)?;
        writeln!(f, "  Buffer pages: {}", self.buffer_pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_memory_budget() {
        let config = PageLogConfig::new(1 << 20, 4096);
        assert_eq!(config.memory_pages, 256);
        assert_eq!(config.page_size, 4096);
    }

    #[test]
    fn test_config_validation() {
        assert!(PageLogConfig::default().validate().is_ok());

        let mut bad = PageLogConfig::default();
        bad.page_size = 1000;
        assert_eq!(bad.validate(), Err(Status::InvalidArgument));

        let mut bad = PageLogConfig::default();
        bad.page_size = 256;
        assert_eq!(bad.validate(), Err(Status::InvalidArgument));

        let mut bad = PageLogConfig::default();
        bad.memory_pages = 1;
        assert_eq!(bad.validate(), Err(Status::InvalidArgument));
    }
}
