//! File-backed storage devices.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::device::SyncStorageDevice;

/// A single data file with mutex-protected positioned I/O.
pub struct FileSystemFile {
    /// Path to the file
    path: PathBuf,
    /// The underlying file
    file: Mutex<File>,
}

impl FileSystemFile {
    /// Open or create a file at the specified path
    pub fn open(path: impl AsRef<Path>, create: bool) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Get the path to the file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SyncStorageDevice for FileSystemFile {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        // Read until the buffer is full or EOF; positioned reads near the
        // device tail legitimately come up short.
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush_sync(&self) -> io::Result<()> {
        self.file.lock().sync_all()
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        self.file.lock().set_len(size)
    }

    fn size_sync(&self) -> io::Result<u64> {
        self.file.lock().metadata().map(|m| m.len())
    }
}

/// Segmented file for large storage.
///
/// Spreads the address space over numbered segment files so that a log can
/// exceed single-file limits and old segments can eventually be unlinked.
pub struct SegmentedFile {
    /// Base directory
    base_dir: PathBuf,
    /// File prefix
    prefix: String,
    /// Segment size in bytes
    segment_size: u64,
    /// Open segments
    segments: Mutex<Vec<Option<FileSystemFile>>>,
}

impl SegmentedFile {
    /// Create a new segmented file
    pub fn new(base_dir: impl AsRef<Path>, prefix: &str, segment_size: u64) -> io::Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;

        Ok(Self {
            base_dir,
            prefix: prefix.to_string(),
            segment_size,
            segments: Mutex::new(Vec::new()),
        })
    }

    /// Get the segment file path for a given segment index
    fn segment_path(&self, segment: u64) -> PathBuf {
        self.base_dir.join(format!("{}.{}", self.prefix, segment))
    }

    /// Run `op` against the segment containing `offset`, opening it on demand.
    fn with_segment<T>(
        &self,
        offset: u64,
        op: impl FnOnce(&FileSystemFile, u64) -> io::Result<T>,
    ) -> io::Result<T> {
        let segment = offset / self.segment_size;
        let segment_offset = offset % self.segment_size;

        let mut segments = self.segments.lock();
        while segments.len() <= segment as usize {
            segments.push(None);
        }
        if segments[segment as usize].is_none() {
            let file = FileSystemFile::open(self.segment_path(segment), true)?;
            segments[segment as usize] = Some(file);
        }

        op(segments[segment as usize].as_ref().unwrap(), segment_offset)
    }
}

impl SyncStorageDevice for SegmentedFile {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.with_segment(offset, |file, segment_offset| {
            file.read_sync(segment_offset, buf)
        })
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        self.with_segment(offset, |file, segment_offset| {
            file.write_sync(segment_offset, buf)
        })
    }

    fn flush_sync(&self) -> io::Result<()> {
        let segments = self.segments.lock();
        for segment in segments.iter().flatten() {
            segment.flush_sync()?;
        }
        Ok(())
    }

    fn truncate_sync(&self, _size: u64) -> io::Result<()> {
        // Segment unlinking is left to external cleanup.
        Ok(())
    }

    fn size_sync(&self) -> io::Result<u64> {
        let segments = self.segments.lock();
        let mut total = 0u64;
        for segment in segments.iter().flatten() {
            total += segment.size_sync()?;
        }
        Ok(total)
    }
}

/// File system disk device: single-file or segmented.
pub struct FileSystemDisk {
    inner: FileSystemDiskInner,
}

enum FileSystemDiskInner {
    SingleFile(FileSystemFile),
    Segmented(SegmentedFile),
}

impl FileSystemDisk {
    /// Create a single-file disk
    pub fn single_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = FileSystemFile::open(path, true)?;
        Ok(Self {
            inner: FileSystemDiskInner::SingleFile(file),
        })
    }

    /// Create a segmented disk
    pub fn segmented(
        base_dir: impl AsRef<Path>,
        prefix: &str,
        segment_size: u64,
    ) -> io::Result<Self> {
        let segments = SegmentedFile::new(base_dir, prefix, segment_size)?;
        Ok(Self {
            inner: FileSystemDiskInner::Segmented(segments),
        })
    }
}

impl SyncStorageDevice for FileSystemDisk {
    fn read_sync(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => f.read_sync(offset, buf),
            FileSystemDiskInner::Segmented(s) => s.read_sync(offset, buf),
        }
    }

    fn write_sync(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => f.write_sync(offset, buf),
            FileSystemDiskInner::Segmented(s) => s.write_sync(offset, buf),
        }
    }

    fn flush_sync(&self) -> io::Result<()> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => f.flush_sync(),
            FileSystemDiskInner::Segmented(s) => s.flush_sync(),
        }
    }

    fn truncate_sync(&self, size: u64) -> io::Result<()> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => f.truncate_sync(size),
            FileSystemDiskInner::Segmented(s) => s.truncate_sync(size),
        }
    }

    fn size_sync(&self) -> io::Result<u64> {
        match &self.inner {
            FileSystemDiskInner::SingleFile(f) => f.size_sync(),
            FileSystemDiskInner::Segmented(s) => s.size_sync(),
        }
    }
}
