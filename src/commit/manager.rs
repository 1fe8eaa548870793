//! Commit manager: durable storage for the commit metadata blob.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::address::Address;

/// Durable store for the most recent commit metadata blob.
///
/// `commit` must not return before the blob is stable; recovery reads the
/// blob back through `get_metadata`.
pub trait CommitManager: Send + Sync + 'static {
    /// Persist `metadata` durably before returning.
    ///
    /// `begin_address` and `flushed_until_address` duplicate the decoded
    /// content for managers that index commits externally.
    fn commit(
        &self,
        begin_address: Address,
        flushed_until_address: Address,
        metadata: &[u8],
    ) -> io::Result<()>;

    /// Retrieve the most recent durable blob, or `None` for a fresh log.
    fn get_metadata(&self) -> io::Result<Option<Vec<u8>>>;
}

/// File-backed commit manager: one side file holding the latest blob.
///
/// The blob is small, checksummed, and rewritten in place; a torn write is
/// caught by the checksum on recovery and treated as corruption.
pub struct LocalCommitManager {
    path: PathBuf,
    file: Mutex<File>,
}

impl LocalCommitManager {
    /// Open or create the commit file at `path`
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the commit file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CommitManager for LocalCommitManager {
    fn commit(
        &self,
        _begin_address: Address,
        _flushed_until_address: Address,
        metadata: &[u8],
    ) -> io::Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(metadata)?;
        file.sync_all()
    }

    fn get_metadata(&self) -> io::Result<Option<Vec<u8>>> {
        let mut file = self.file.lock();
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(None);
        }

        let mut buf = Vec::with_capacity(len as usize);
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut buf)?;
        Ok(Some(buf))
    }
}

/// In-memory commit manager for tests and ephemeral logs.
#[derive(Default)]
pub struct MemoryCommitManager {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryCommitManager {
    /// Create an empty in-memory commit manager
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommitManager for MemoryCommitManager {
    fn commit(
        &self,
        _begin_address: Address,
        _flushed_until_address: Address,
        metadata: &[u8],
    ) -> io::Result<()> {
        *self.blob.lock() = Some(metadata.to_vec());
        Ok(())
    }

    fn get_metadata(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.blob.lock().clone())
    }
}
