//! Commit coordinator: serialized metadata writes and waiter wakeup.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::address::{Address, AtomicAddress};
use crate::commit::manager::CommitManager;
use crate::commit::metadata::CommitMetadata;
use crate::status::Status;

/// Serializes commit metadata writes and publishes committed watermarks.
///
/// Invoked by the flush worker on each flush completion and by explicit
/// commit requests. Producers never take the commit lock; they subscribe to
/// the watch channel, whose send happens outside the lock.
pub(crate) struct CommitCoordinator {
    /// Live begin address, shared with the allocator (truncation raises it)
    begin_address: Arc<AtomicAddress>,
    /// Oldest byte guaranteed retained across restart
    committed_begin: AtomicAddress,
    /// Exclusive upper bound of bytes with persisted durability
    committed_until: AtomicAddress,
    /// Held only for the metadata write; commits are flush-cadence rare
    commit_lock: Mutex<()>,
    manager: Box<dyn CommitManager>,
    /// Dropped on dispose so pending waiters resolve with a terminal error
    notify_tx: Mutex<Option<watch::Sender<u64>>>,
    notify_rx: watch::Receiver<u64>,
}

impl CommitCoordinator {
    pub(crate) fn new(
        begin_address: Arc<AtomicAddress>,
        manager: Box<dyn CommitManager>,
        committed_begin: Address,
        committed_until: Address,
    ) -> Self {
        let (tx, rx) = watch::channel(committed_until.control());
        Self {
            begin_address,
            committed_begin: AtomicAddress::new(committed_begin),
            committed_until: AtomicAddress::new(committed_until),
            commit_lock: Mutex::new(()),
            manager,
            notify_tx: Mutex::new(Some(tx)),
            notify_rx: rx,
        }
    }

    /// Oldest byte guaranteed retained across restart
    #[inline]
    pub(crate) fn committed_begin(&self) -> Address {
        self.committed_begin.load(Ordering::Acquire)
    }

    /// Exclusive upper bound of committed bytes
    #[inline]
    pub(crate) fn committed_until(&self) -> Address {
        self.committed_until.load(Ordering::Acquire)
    }

    /// Subscribe to commit completions.
    ///
    /// The returned receiver has the current value marked as seen, so a
    /// subsequent `changed().await` resolves only for commits published
    /// after this call. Callers must subscribe *before* the attempt whose
    /// failure they will wait out, or a commit landing in between is lost.
    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        let mut rx = self.notify_rx.clone();
        rx.borrow_and_update();
        rx
    }

    /// Record a flush completion (or an explicit commit request) at
    /// `flush_address`, persisting metadata if any watermark advances.
    pub(crate) fn flush_completed(&self, flush_address: Address) -> Result<(), Status> {
        let begin = self.begin_address.load(Ordering::Acquire);

        let guard = self.commit_lock.lock();

        let committed_begin = self.committed_begin.load(Ordering::Acquire);
        let committed_until = self.committed_until.load(Ordering::Acquire);

        if begin <= committed_begin && flush_address <= committed_until {
            return Ok(());
        }

        // Clamp upward so a stale flush callback cannot regress a watermark.
        let info = CommitMetadata::new(
            begin.max(committed_begin).control(),
            flush_address.max(committed_until).control(),
        );

        let blob = info.encode_vec();
        self.manager
            .commit(
                Address::from_control(info.begin_address),
                Address::from_control(info.flushed_until_address),
                &blob,
            )
            .map_err(|e| {
                tracing::warn!("commit metadata write failed: {e}");
                Status::IoError
            })?;

        self.committed_begin
            .store(Address::from_control(info.begin_address), Ordering::Release);
        self.committed_until.store(
            Address::from_control(info.flushed_until_address),
            Ordering::Release,
        );

        drop(guard);

        // Wake waiters outside the lock. The send also fires for begin-only
        // commits; waiters re-check their watermark and go back to sleep.
        if let Some(tx) = &*self.notify_tx.lock() {
            let _ = tx.send(info.flushed_until_address);
        }
        Ok(())
    }

    /// Force a metadata write when only the begin address advanced.
    pub(crate) fn persist_begin(&self) -> Result<(), Status> {
        self.flush_completed(self.committed_until())
    }

    /// Wake all subscribers without a commit.
    ///
    /// Used when ring slots become reusable: parked producers must retry
    /// even though no watermark moved.
    pub(crate) fn notify_waiters(&self) {
        if let Some(tx) = &*self.notify_tx.lock() {
            tx.send_modify(|_| {});
        }
    }

    /// Complete all pending waiters with the disposed error.
    pub(crate) fn dispose(&self) {
        self.notify_tx.lock().take();
    }
}
