//! The PageLog: concurrent appends, commits, reads, truncation, restore.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::address::{Address, AtomicAddress};
use crate::allocator::flush::FlushCallback;
use crate::allocator::ring::{LogAllocator, LogGeometry};
use crate::commit::{CommitCoordinator, CommitManager, CommitMetadata};
use crate::constants::FIRST_VALID_ADDRESS;
use crate::device::StorageDevice;
use crate::epoch::{get_thread_id, EpochGuard, EpochManager};
use crate::log::config::{LogStats, PageLogConfig};
use crate::log::scan::{LogScanIterator, ScanBuffering};
use crate::record;
use crate::status::Status;
use crate::utility::{pad_alignment, AlignedBuffer};

/// How long `close` waits for the final commit before giving up
const CLOSE_COMMIT_TIMEOUT_MS: u32 = 5_000;

pub(crate) struct LogInner<D: StorageDevice> {
    pub(crate) config: PageLogConfig,
    pub(crate) geometry: LogGeometry,
    pub(crate) allocator: LogAllocator<D>,
    pub(crate) epoch: Arc<EpochManager>,
    pub(crate) committer: Arc<CommitCoordinator>,
    pub(crate) closed: AtomicBool,
}

/// A high-performance persistent append-only log.
///
/// Producers append variable-length byte entries from any thread; closed
/// regions flush asynchronously; a commit durably publishes
/// `{begin, flushed-until}` and wakes waiters. Committed records are stable
/// and scannable in insertion order until [`PageLog::truncate_until`] drops
/// a prefix.
pub struct PageLog<D: StorageDevice> {
    inner: Arc<LogInner<D>>,
    auto_commit: Mutex<Option<AutoCommitHandle>>,
}

impl<D: StorageDevice> PageLog<D> {
    /// Open a log over `device`, restoring from the commit manager's last
    /// metadata blob if one exists.
    pub fn open(
        config: PageLogConfig,
        device: D,
        commit_manager: Box<dyn CommitManager>,
    ) -> Result<Self, Status> {
        config.validate()?;
        let geometry = LogGeometry::new(config.page_size, config.memory_pages)?;

        let restored = match commit_manager.get_metadata().map_err(|e| {
            warn!("failed to read commit metadata: {e}");
            Status::IoError
        })? {
            None => None,
            Some(blob) => Some(CommitMetadata::decode(&blob).map_err(|e| {
                warn!("invalid commit metadata: {e}");
                Status::Corruption
            })?),
        };

        let first = FIRST_VALID_ADDRESS;
        let (begin, flushed) = match &restored {
            None => (first, first),
            Some(meta) => {
                let begin = Address::from_control(meta.begin_address).max(first);
                let flushed = Address::from_control(meta.flushed_until_address).max(begin);
                (begin, flushed)
            }
        };

        let epoch = Arc::new(EpochManager::new());
        let begin_address = Arc::new(AtomicAddress::new(begin));
        let committer = Arc::new(CommitCoordinator::new(
            Arc::clone(&begin_address),
            commit_manager,
            begin,
            flushed,
        ));

        let on_flush: FlushCallback = {
            let committer = Arc::clone(&committer);
            Box::new(move |flushed| {
                // Failures are logged by the coordinator; the committed
                // watermark simply does not advance.
                let _ = committer.flush_completed(flushed);
            })
        };

        let on_slots_freed: Arc<dyn Fn() + Send + Sync> = {
            let committer = Arc::clone(&committer);
            Arc::new(move || committer.notify_waiters())
        };

        let allocator = LogAllocator::new(
            geometry,
            Arc::new(device),
            Arc::clone(&epoch),
            begin_address,
            on_flush,
            on_slots_freed,
        )?;

        let head = flushed.page_start(geometry.page_bits);
        allocator.restore(flushed, head, begin);

        debug!(
            "opened log: begin {begin}, flushed {flushed}, restored {}",
            restored.is_some()
        );

        let inner = Arc::new(LogInner {
            config: config.clone(),
            geometry,
            allocator,
            epoch,
            committer,
            closed: AtomicBool::new(false),
        });

        let auto_commit = if config.auto_commit_ms > 0 {
            Some(spawn_auto_commit(&inner, config.auto_commit_ms))
        } else {
            None
        };

        Ok(Self {
            inner,
            auto_commit: Mutex::new(auto_commit),
        })
    }

    /// Append an entry, spinning while the allocator reports back-pressure.
    ///
    /// Returns the entry's logical address. Failure is transient at
    /// microsecond scale (the flusher catches up), so spinning beats paying
    /// wakeup latency on the hot path.
    pub fn enqueue(&self, payload: &[u8]) -> Result<Address, Status> {
        loop {
            if let Some(addr) = self.inner.try_append(payload)? {
                return Ok(addr);
            }
            self.inner.pump_epoch();
            thread::yield_now();
        }
    }

    /// Append a batch atomically, spinning on back-pressure.
    ///
    /// Returns the first record's address and the total allocated length.
    pub fn enqueue_batch<T: AsRef<[u8]>>(&self, entries: &[T]) -> Result<(Address, u32), Status> {
        loop {
            if let Some(result) = self.inner.try_append_batch(entries)? {
                return Ok(result);
            }
            self.inner.pump_epoch();
            thread::yield_now();
        }
    }

    /// Try to append an entry without blocking.
    ///
    /// `Ok(None)` means the log is transiently full; retry, optionally after
    /// [`PageLog::wait_for_commit`] or the async variants.
    pub fn try_enqueue(&self, payload: &[u8]) -> Result<Option<Address>, Status> {
        self.inner.try_append(payload)
    }

    /// Try to append a batch without blocking.
    ///
    /// On success all records occupy consecutive addresses starting at the
    /// returned one; on `Ok(None)` none were appended.
    pub fn try_enqueue_batch<T: AsRef<[u8]>>(
        &self,
        entries: &[T],
    ) -> Result<Option<(Address, u32)>, Status> {
        self.inner.try_append_batch(entries)
    }

    /// Append an entry, awaiting the commit notification on back-pressure.
    pub async fn enqueue_async(&self, payload: &[u8]) -> Result<Address, Status> {
        loop {
            // Subscribe before the attempt: a commit landing between a failed
            // try and the await below would otherwise be lost.
            let mut commit_rx = self.inner.committer.subscribe();
            if let Some(addr) = self.inner.try_append(payload)? {
                return Ok(addr);
            }
            commit_rx.changed().await.map_err(|_| Status::Aborted)?;
        }
    }

    /// Append a batch atomically, awaiting the commit notification on
    /// back-pressure.
    pub async fn enqueue_batch_async<T: AsRef<[u8]>>(
        &self,
        entries: &[T],
    ) -> Result<(Address, u32), Status> {
        loop {
            let mut commit_rx = self.inner.committer.subscribe();
            if let Some(result) = self.inner.try_append_batch(entries)? {
                return Ok(result);
            }
            commit_rx.changed().await.map_err(|_| Status::Aborted)?;
        }
    }

    /// Append an entry and spin until it is committed.
    ///
    /// Something must drive commits: auto-commit, a committer thread, or the
    /// flush cadence of concurrent producers.
    pub fn enqueue_and_wait_for_commit(&self, payload: &[u8]) -> Result<Address, Status> {
        let addr = self.enqueue(payload)?;
        self.wait_for_commit(addr + record::entry_size(payload.len()) as u64)?;
        Ok(addr)
    }

    /// Async variant of [`PageLog::enqueue_and_wait_for_commit`]
    pub async fn enqueue_and_wait_for_commit_async(
        &self,
        payload: &[u8],
    ) -> Result<Address, Status> {
        let addr = self.enqueue_async(payload).await?;
        self.inner
            .wait_for_commit_async(addr + record::entry_size(payload.len()) as u64)
            .await?;
        Ok(addr)
    }

    /// Append a batch and spin until the whole batch is committed.
    pub fn enqueue_batch_and_wait_for_commit<T: AsRef<[u8]>>(
        &self,
        entries: &[T],
    ) -> Result<(Address, u32), Status> {
        let (addr, allocated) = self.enqueue_batch(entries)?;
        self.wait_for_commit(addr + allocated as u64)?;
        Ok((addr, allocated))
    }

    /// Async variant of [`PageLog::enqueue_batch_and_wait_for_commit`]
    pub async fn enqueue_batch_and_wait_for_commit_async<T: AsRef<[u8]>>(
        &self,
        entries: &[T],
    ) -> Result<(Address, u32), Status> {
        let (addr, allocated) = self.enqueue_batch_async(entries).await?;
        self.inner
            .wait_for_commit_async(addr + allocated as u64)
            .await?;
        Ok((addr, allocated))
    }

    /// Spin until the committed watermark reaches `until`.
    ///
    /// [`Address::NONE`] means the tail at call time.
    pub fn wait_for_commit(&self, until: Address) -> Result<(), Status> {
        let until = if until.is_none() {
            self.inner.allocator.tail_address()
        } else {
            until
        };
        loop {
            if self.inner.committer.committed_until() >= until {
                return Ok(());
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(Status::Aborted);
            }
            self.inner.pump_epoch();
            thread::yield_now();
        }
    }

    /// Await the committed watermark reaching `until`.
    ///
    /// [`Address::NONE`] means the tail at call time.
    pub async fn wait_for_commit_async(&self, until: Address) -> Result<(), Status> {
        self.inner.wait_for_commit_async(until).await
    }

    /// Close the open suffix and request a commit.
    ///
    /// With `spin_wait`, pumps the epoch drainer until the committed
    /// watermark reaches the tail observed at the shift. Returns that tail.
    pub fn commit(&self, spin_wait: bool) -> Result<Address, Status> {
        self.inner.commit(spin_wait)
    }

    /// Async commit: shift, then await the committed watermark.
    pub async fn commit_async(&self) -> Result<Address, Status> {
        self.inner.check_open()?;
        let tail = self.inner.request_commit()?;
        self.inner.wait_for_commit_async(tail).await?;
        Ok(tail)
    }

    /// Read the record at `address`.
    ///
    /// Returns `Ok(None)` for addresses outside `[begin, committed-until)`
    /// and for corrupt frames. `estimated_length` sizes the first device
    /// read; an underestimate costs one extra read at the discovered size.
    pub async fn read_async(
        &self,
        address: Address,
        estimated_length: u32,
    ) -> Result<Option<Vec<u8>>, Status> {
        self.inner.read_async(address, estimated_length).await
    }

    /// Iterate records in `[begin, end)`, gated at the live committed
    /// watermark. Construction is safe concurrently with appends.
    pub fn scan(
        &self,
        begin: Address,
        end: Address,
        buffering: ScanBuffering,
    ) -> LogScanIterator<'_, D> {
        let start = begin.max(self.inner.allocator.begin_address());
        LogScanIterator::new(&self.inner, start, end, buffering)
    }

    /// Scan every committed record from the current begin address
    pub fn scan_all(&self) -> LogScanIterator<'_, D> {
        let begin = self.inner.allocator.begin_address();
        let end = self.inner.committer.committed_until();
        LogScanIterator::new(&self.inner, begin, end, ScanBuffering::SinglePage)
    }

    /// Drop the prefix below `address` and persist the new begin address.
    ///
    /// `address` must not exceed the committed watermark. Returns the begin
    /// address after the shift.
    pub fn truncate_until(&self, address: Address) -> Result<Address, Status> {
        self.inner.check_open()?;
        if address > self.inner.committer.committed_until() {
            return Err(Status::InvalidArgument);
        }

        let begin = self.inner.allocator.begin_address();
        if address <= begin {
            return Ok(begin);
        }

        self.inner.allocator.shift_begin_address(address);
        self.inner.committer.persist_begin()?;
        Ok(self.inner.allocator.begin_address())
    }

    /// Oldest logically retained address
    pub fn begin_address(&self) -> Address {
        self.inner.allocator.begin_address()
    }

    /// Oldest address guaranteed retained across restart
    pub fn committed_begin_address(&self) -> Address {
        self.inner.committer.committed_begin()
    }

    /// Exclusive upper bound of committed bytes
    pub fn committed_until_address(&self) -> Address {
        self.inner.committer.committed_until()
    }

    /// Exclusive upper bound of bytes durable on the device
    pub fn flushed_until_address(&self) -> Address {
        self.inner.allocator.flushed_until_address()
    }

    /// Next address the allocator will hand out
    pub fn tail_address(&self) -> Address {
        self.inner.allocator.tail_address()
    }

    /// Snapshot of watermarks and geometry
    pub fn stats(&self) -> LogStats {
        LogStats {
            begin_address: self.begin_address(),
            committed_begin_address: self.committed_begin_address(),
            committed_until_address: self.committed_until_address(),
            flushed_until_address: self.flushed_until_address(),
            tail_address: self.tail_address(),
            page_size: self.inner.config.page_size,
            buffer_pages: self.inner.config.memory_pages,
        }
    }

    /// Whether the log has been closed
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close the log: final best-effort commit, then fail all pending
    /// waiters with `Aborted` and stop the background workers.
    pub fn close(&self) {
        if let Some(handle) = self.auto_commit.lock().take() {
            let _ = handle.tx.send(());
            let _ = handle.worker.join();
        }
        self.inner.close();
    }
}

impl<D: StorageDevice> Drop for PageLog<D> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<D: StorageDevice> LogInner<D> {
    pub(crate) fn check_open(&self) -> Result<(), Status> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Status::Aborted);
        }
        Ok(())
    }

    /// Run one epoch drain step on the calling thread
    pub(crate) fn pump_epoch(&self) {
        if let Ok(tid) = get_thread_id() {
            self.epoch.pump(tid);
        }
    }

    pub(crate) fn try_append(&self, payload: &[u8]) -> Result<Option<Address>, Status> {
        self.check_open()?;
        if payload.is_empty() {
            return Err(Status::InvalidArgument);
        }
        let total = record::entry_size(payload.len());
        if total as u64 > self.geometry.page_size {
            return Err(Status::InvalidArgument);
        }

        let tid = get_thread_id()?;
        let guard = EpochGuard::new(&self.epoch, tid);
        let Some(addr) = self.allocator.try_allocate(total as u32) else {
            drop(guard);
            return Ok(None);
        };
        // Safety: the reservation is exclusive and the guard keeps the page
        // resident until the copy finishes.
        unsafe { record::write_frame(self.allocator.get_physical(addr).as_ptr(), payload) };
        drop(guard);
        Ok(Some(addr))
    }

    pub(crate) fn try_append_batch<T: AsRef<[u8]>>(
        &self,
        entries: &[T],
    ) -> Result<Option<(Address, u32)>, Status> {
        self.check_open()?;
        if entries.is_empty() {
            return Err(Status::InvalidArgument);
        }
        let mut total: u64 = 0;
        for entry in entries {
            let entry = entry.as_ref();
            if entry.is_empty() {
                return Err(Status::InvalidArgument);
            }
            total += record::entry_size(entry.len()) as u64;
        }
        // A batch is one allocation and never straddles a page.
        if total > self.geometry.page_size {
            return Err(Status::InvalidArgument);
        }

        let tid = get_thread_id()?;
        let guard = EpochGuard::new(&self.epoch, tid);
        let Some(addr) = self.allocator.try_allocate(total as u32) else {
            drop(guard);
            return Ok(None);
        };
        let mut cursor = addr;
        for entry in entries {
            let entry = entry.as_ref();
            unsafe { record::write_frame(self.allocator.get_physical(cursor).as_ptr(), entry) };
            cursor += record::entry_size(entry.len()) as u64;
        }
        drop(guard);
        Ok(Some((addr, total as u32)))
    }

    /// Shift the read-only boundary to the tail; persist a raised begin
    /// address when nothing shifted. Returns the tail at the shift.
    pub(crate) fn request_commit(&self) -> Result<Address, Status> {
        let (shifted, tail) = self.allocator.shift_read_only_to_tail();
        if !shifted {
            self.committer.persist_begin()?;
        }
        Ok(tail)
    }

    pub(crate) fn commit(&self, spin_wait: bool) -> Result<Address, Status> {
        self.check_open()?;
        let tail = self.request_commit()?;
        if spin_wait {
            loop {
                if self.committer.committed_until() >= tail {
                    break;
                }
                if self.closed.load(Ordering::Acquire) {
                    return Err(Status::Aborted);
                }
                self.pump_epoch();
                thread::yield_now();
            }
        }
        Ok(tail)
    }

    pub(crate) async fn wait_for_commit_async(&self, until: Address) -> Result<(), Status> {
        let until = if until.is_none() {
            self.allocator.tail_address()
        } else {
            until
        };
        loop {
            let mut commit_rx = self.committer.subscribe();
            if self.committer.committed_until() >= until {
                return Ok(());
            }
            commit_rx.changed().await.map_err(|_| Status::Aborted)?;
        }
    }

    pub(crate) async fn read_async(
        &self,
        address: Address,
        estimated_length: u32,
    ) -> Result<Option<Vec<u8>>, Status> {
        self.check_open()?;
        let tid = get_thread_id()?;
        {
            let _guard = EpochGuard::new(&self.epoch, tid);
            let begin = self.allocator.begin_address();
            let committed = self.committer.committed_until();
            if address < begin || address + record::HEADER_SIZE as u64 > committed {
                return Ok(None);
            }
        }

        let max_payload = self.geometry.page_size as usize - record::HEADER_SIZE;
        let first_len = record::HEADER_SIZE + estimated_length as usize;
        let buf = self.read_device(address, first_len).await?;

        let Some(length) = record::read_length(&buf) else {
            return Ok(None);
        };
        let length = length as usize;
        if length == 0 || length > max_payload {
            warn!("corrupt record header at {address}: length {length}");
            return Ok(None);
        }
        if buf.len() >= record::HEADER_SIZE + length {
            return Ok(Some(
                buf[record::HEADER_SIZE..record::HEADER_SIZE + length].to_vec(),
            ));
        }

        // Size discovery: release the first buffer and re-issue at the exact
        // size.
        drop(buf);
        let buf = self.read_device(address, record::HEADER_SIZE + length).await?;
        if buf.len() < record::HEADER_SIZE + length {
            warn!(
                "short read at {address}: wanted {} bytes, got {}",
                record::HEADER_SIZE + length,
                buf.len()
            );
            return Ok(None);
        }
        Ok(Some(
            buf[record::HEADER_SIZE..record::HEADER_SIZE + length].to_vec(),
        ))
    }

    /// Read `len` bytes at `address` through an aligned buffer.
    ///
    /// Returns the bytes actually available (short at the device tail).
    async fn read_device(&self, address: Address, len: usize) -> Result<Vec<u8>, Status> {
        let alignment = self.allocator.device().alignment().max(8);
        let padded = pad_alignment(len.max(1), alignment);
        let mut buffer = AlignedBuffer::zeroed(alignment, padded).ok_or(Status::OutOfMemory)?;

        let read = self
            .allocator
            .device()
            .read(address.control(), &mut buffer.as_mut_slice()[..len])
            .await
            .map_err(|e| {
                warn!("device read failed at {address}: {e}");
                Status::IoError
            })?;

        Ok(buffer.as_slice()[..read.min(len)].to_vec())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Final commit so appended entries survive the close.
        let (_, tail) = self.allocator.shift_read_only_to_tail();
        let mut waited = 0u32;
        while self.committer.committed_until() < tail {
            self.pump_epoch();
            thread::sleep(Duration::from_millis(1));
            waited += 1;
            if waited > CLOSE_COMMIT_TIMEOUT_MS {
                warn!("close timed out waiting for final commit at {tail}");
                break;
            }
        }

        self.committer.dispose();
        self.allocator.shutdown();
        debug!("log closed at tail {tail}");
    }
}

struct AutoCommitHandle {
    tx: Sender<()>,
    worker: thread::JoinHandle<()>,
}

fn spawn_auto_commit<D: StorageDevice>(
    inner: &Arc<LogInner<D>>,
    interval_ms: u64,
) -> AutoCommitHandle {
    let (tx, rx) = bounded::<()>(1);
    let weak: Weak<LogInner<D>> = Arc::downgrade(inner);

    let worker = thread::Builder::new()
        .name("pagelog-autocommit".into())
        .spawn(move || loop {
            match rx.recv_timeout(Duration::from_millis(interval_ms)) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(inner) = weak.upgrade() else { break };
                    match inner.commit(false) {
                        Err(Status::Aborted) => break,
                        Err(status) => warn!("auto-commit failed: {status}"),
                        Ok(_) => {}
                    }
                }
                _ => break,
            }
        })
        .expect("failed to spawn auto-commit worker");

    AutoCommitHandle { tx, worker }
}
