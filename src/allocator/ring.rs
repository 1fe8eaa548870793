//! The page ring and lock-free tail allocation.

use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::address::{Address, AtomicAddress, AtomicPageOffset, PageOffset, MAX_PAGE};
use crate::constants::FIRST_VALID_ADDRESS;
use crate::device::StorageDevice;
use crate::epoch::EpochManager;
use crate::status::Status;
use crate::utility::{is_power_of_two, AlignedBuffer};

use super::flush::{submit_flush_ranges, FlushCallback, FlushManager, FlushShared};

/// Fixed geometry of the ring: page size and in-memory page count.
#[derive(Debug, Clone, Copy)]
pub struct LogGeometry {
    /// Page size in bytes (power of two)
    pub page_size: u64,
    /// log2 of the page size
    pub page_bits: u32,
    /// Number of pages in the in-memory ring
    pub buffer_pages: u32,
}

impl LogGeometry {
    /// Build a geometry, validating the page size
    pub fn new(page_size: usize, buffer_pages: u32) -> Result<Self, Status> {
        if !is_power_of_two(page_size as u64) || buffer_pages < 2 {
            return Err(Status::InvalidArgument);
        }
        Ok(Self {
            page_size: page_size as u64,
            page_bits: (page_size as u64).trailing_zeros(),
            buffer_pages,
        })
    }

    /// Page number containing `addr`
    #[inline]
    pub fn page_of(&self, addr: Address) -> u64 {
        addr.control() >> self.page_bits
    }

    /// Offset of `addr` within its page
    #[inline]
    pub fn offset_of(&self, addr: Address) -> u64 {
        addr.control() & (self.page_size - 1)
    }

    /// Address of `offset` within `page`
    #[inline]
    pub fn address_of(&self, page: u64, offset: u64) -> Address {
        Address::from_control((page << self.page_bits) + offset)
    }

    /// Start address of `page`
    #[inline]
    pub fn page_start(&self, page: u64) -> Address {
        Address::from_control(page << self.page_bits)
    }
}

/// Shared watermark state of the ring.
///
/// Producers, the flush worker, and the commit coordinator all hold views of
/// these addresses; each is individually monotone.
pub(crate) struct RingState {
    pub(crate) geometry: LogGeometry,
    /// Next allocation position (packed page + offset with overflow space)
    pub(crate) tail: AtomicPageOffset,
    /// Oldest logically retained byte; shared with the commit coordinator
    pub(crate) begin_address: Arc<AtomicAddress>,
    /// First byte backed by the in-memory ring (page aligned)
    pub(crate) head_address: AtomicAddress,
    /// Head after epoch drain; ring slot reuse is gated on this
    pub(crate) safe_head_address: AtomicAddress,
    /// Exclusive upper bound of bytes whose flush has been scheduled
    pub(crate) read_only_address: AtomicAddress,
    /// Exclusive upper bound of bytes durable on the device
    pub(crate) flushed_until_address: AtomicAddress,
    /// Wakes parked producers when ring slots become reusable; safe head
    /// advances are not commits, so the flush callback alone cannot wake
    /// async waiters parked on the commit notification.
    pub(crate) on_slots_freed: Arc<dyn Fn() + Send + Sync>,
}

/// Advance the head so the ring slot after the current tail page can be
/// reused, never past the page-aligned flushed-until address. The safe head
/// follows once every thread resumed at the shift has suspended.
pub(crate) fn advance_head(state: &Arc<RingState>, epoch: &EpochManager) {
    let g = state.geometry;
    let tail_page = state.tail.load(Ordering::Acquire).page() as u64;

    let needed_pages = tail_page + 2;
    if needed_pages <= g.buffer_pages as u64 {
        return;
    }
    let desired = (needed_pages - g.buffer_pages as u64) << g.page_bits;
    let flushed_floor = state.flushed_until_address.load(Ordering::Acquire).control()
        & !(g.page_size - 1);
    let new_head = Address::from_control(desired.min(flushed_floor));

    if state.head_address.bump_to(new_head).is_some() {
        let state = Arc::clone(state);
        epoch.defer(move || {
            if state.safe_head_address.bump_to(new_head).is_some() {
                (state.on_slots_freed)();
            }
        });
    }
}

/// In-memory page ring: `buffer_pages` aligned, zero-initialized buffers.
///
/// Concurrent producers write disjoint reservations through raw pointers;
/// the flush worker reads ranges only after the epoch drain that follows a
/// read-only shift, so no range is read while still being written.
pub(crate) struct PageRing {
    geometry: LogGeometry,
    slots: Box<[AlignedBuffer]>,
}

impl PageRing {
    fn new(geometry: LogGeometry) -> Result<Self, Status> {
        let page_size = geometry.page_size as usize;
        let mut slots = Vec::with_capacity(geometry.buffer_pages as usize);
        for _ in 0..geometry.buffer_pages {
            slots.push(AlignedBuffer::zeroed(page_size, page_size).ok_or(Status::OutOfMemory)?);
        }
        Ok(Self {
            geometry,
            slots: slots.into_boxed_slice(),
        })
    }

    #[inline]
    fn slot(&self, page: u64) -> &AlignedBuffer {
        &self.slots[(page % self.geometry.buffer_pages as u64) as usize]
    }

    /// Pointer to the byte backing `addr`.
    ///
    /// # Safety
    ///
    /// The caller must be resumed in the epoch manager and `addr` must be at
    /// or above the safe head (its page still occupies its ring slot).
    #[inline]
    pub(crate) unsafe fn ptr_at(&self, addr: Address) -> NonNull<u8> {
        let page = self.geometry.page_of(addr);
        let offset = self.geometry.offset_of(addr) as usize;
        NonNull::new_unchecked(self.slot(page).as_ptr().add(offset))
    }

    /// Copy `[from, to)` (within one page) out of the ring.
    ///
    /// # Safety
    ///
    /// Callable only after the epoch drain for the read-only shift covering
    /// the range: no producer is still writing it, and the slot cannot have
    /// been reused because the range is not yet flushed.
    pub(crate) unsafe fn copy_range(&self, from: Address, to: Address) -> Vec<u8> {
        debug_assert!(from < to);
        debug_assert_eq!(
            self.geometry.page_of(from),
            self.geometry.page_of(Address::from_control(to.control() - 1))
        );
        let len = (to - from) as usize;
        let mut data = vec![0u8; len];
        std::ptr::copy_nonoverlapping(self.ptr_at(from).as_ptr(), data.as_mut_ptr(), len);
        data
    }

    /// Zero the slot for `page` before it is opened for allocation.
    ///
    /// # Safety
    ///
    /// Caller must own the page transition (tail not yet published) and the
    /// previous occupant of the slot must be behind the safe head.
    unsafe fn zero_slot(&self, page: u64) {
        self.slot(page).zero();
    }
}

/// The paged ring allocator.
pub struct LogAllocator<D: StorageDevice> {
    state: Arc<RingState>,
    ring: Arc<PageRing>,
    device: Arc<D>,
    epoch: Arc<EpochManager>,
    flush: FlushManager,
}

impl<D: StorageDevice> LogAllocator<D> {
    /// Create an allocator over `device` with the given geometry.
    ///
    /// `on_flush` is invoked by the flush worker with each new contiguous
    /// flushed-until address.
    pub(crate) fn new(
        geometry: LogGeometry,
        device: Arc<D>,
        epoch: Arc<EpochManager>,
        begin_address: Arc<AtomicAddress>,
        on_flush: FlushCallback,
        on_slots_freed: Arc<dyn Fn() + Send + Sync>,
    ) -> Result<Self, Status> {
        let first = FIRST_VALID_ADDRESS;
        let state = Arc::new(RingState {
            geometry,
            tail: AtomicPageOffset::new(PageOffset::new(0, first.control())),
            begin_address,
            head_address: AtomicAddress::new(Address::NONE),
            safe_head_address: AtomicAddress::new(Address::NONE),
            read_only_address: AtomicAddress::new(first),
            flushed_until_address: AtomicAddress::new(first),
            on_slots_freed,
        });
        let ring = Arc::new(PageRing::new(geometry)?);

        let flush = FlushManager::new(FlushShared {
            device: Arc::clone(&device),
            state: Arc::clone(&state),
            epoch: Arc::clone(&epoch),
            on_flush,
        });

        Ok(Self {
            state,
            ring,
            device,
            epoch,
            flush,
        })
    }

    /// Ring geometry
    #[inline]
    pub fn geometry(&self) -> LogGeometry {
        self.state.geometry
    }

    /// Device backing the log
    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Current tail address (clamped to the page end while a page transition
    /// is parked on back-pressure)
    #[inline]
    pub fn tail_address(&self) -> Address {
        let po = self.state.tail.load(Ordering::Acquire);
        let g = self.state.geometry;
        g.address_of(po.page() as u64, po.offset().min(g.page_size))
    }

    /// Oldest logically retained address
    #[inline]
    pub fn begin_address(&self) -> Address {
        self.state.begin_address.load(Ordering::Acquire)
    }

    /// First address backed by the in-memory ring
    #[inline]
    pub fn head_address(&self) -> Address {
        self.state.head_address.load(Ordering::Acquire)
    }

    /// Head address after epoch drain
    #[inline]
    pub fn safe_head_address(&self) -> Address {
        self.state.safe_head_address.load(Ordering::Acquire)
    }

    /// Exclusive upper bound of bytes whose flush has been scheduled
    #[inline]
    pub fn read_only_address(&self) -> Address {
        self.state.read_only_address.load(Ordering::Acquire)
    }

    /// Exclusive upper bound of bytes durable on the device
    #[inline]
    pub fn flushed_until_address(&self) -> Address {
        self.state.flushed_until_address.load(Ordering::Acquire)
    }

    /// Try to allocate `num_bytes` at the tail.
    ///
    /// Returns `None` when the allocation must wait: the successor ring slot
    /// is still occupied by an unflushed or undrained page (back-pressure).
    /// The caller retries after awaiting the commit notification.
    ///
    /// The first reservation to cross the page end owns the transition: it
    /// seals the current page and either opens the next one or parks the
    /// tail at the page end. Later crossers fail without side effects.
    pub fn try_allocate(&self, num_bytes: u32) -> Option<Address> {
        let g = self.state.geometry;
        debug_assert!(num_bytes > 0 && num_bytes as u64 <= g.page_size);

        let prev = self.state.tail.reserve(num_bytes);
        let page = prev.page() as u64;
        let offset = prev.offset();

        if offset + num_bytes as u64 <= g.page_size {
            return Some(g.address_of(page, offset));
        }

        if offset <= g.page_size {
            // First crosser: the bytes [offset, page_size) stay zero and
            // read back as page-end padding.
            self.seal_page(page);

            let next = page + 1;
            assert!(next <= MAX_PAGE as u64, "log address space exhausted");

            if !self.can_open(next) {
                // Park the tail at the page end so a later attempt re-enters
                // this transition, and ask for head movement so the flusher
                // can release the slot.
                self.state
                    .tail
                    .store(PageOffset::new(page as u32, g.page_size), Ordering::Release);
                advance_head(&self.state, &self.epoch);
                return None;
            }

            // Safety: the slot's previous page is behind the safe head and
            // the new tail is not yet published.
            unsafe { self.ring.zero_slot(next) };
            self.state
                .tail
                .store(PageOffset::new(next as u32, num_bytes as u64), Ordering::Release);
            return Some(g.page_start(next));
        }

        None
    }

    /// Whether the ring slot for `page` is free to host it
    fn can_open(&self, page: u64) -> bool {
        let g = self.state.geometry;
        if page < g.buffer_pages as u64 {
            return true;
        }
        let evict_end = (page + 1 - g.buffer_pages as u64) << g.page_bits;
        self.state.safe_head_address.load(Ordering::Acquire).control() >= evict_end
    }

    /// Seal `page`: schedule the flush of everything up to its end
    fn seal_page(&self, page: u64) {
        let g = self.state.geometry;
        self.shift_read_only(g.page_start(page + 1));
    }

    /// Close the currently open suffix so the flusher drains it.
    ///
    /// Returns whether anything shifted, and the tail at the moment of the
    /// shift.
    pub fn shift_read_only_to_tail(&self) -> (bool, Address) {
        let tail = self.tail_address();
        (self.shift_read_only(tail), tail)
    }

    /// Raise the read-only boundary to `target`, scheduling the flush of the
    /// newly closed range once every producer resumed at this instant has
    /// finished its copy.
    fn shift_read_only(&self, target: Address) -> bool {
        let Some(prev) = self.state.read_only_address.bump_to(target) else {
            return false;
        };

        let ring = Arc::clone(&self.ring);
        let state = Arc::clone(&self.state);
        let tx = self.flush.sender();
        self.epoch.defer(move || {
            submit_flush_ranges(&state, &ring, &tx, prev, target);
        });
        true
    }

    /// Raise the logical begin address; space below it becomes reclaimable
    pub fn shift_begin_address(&self, addr: Address) {
        self.state.begin_address.bump_to(addr);
    }

    /// Reconstitute ring state on open: future allocations continue from
    /// `flushed`, `head` is the start of the first in-memory page, `begin`
    /// is the logical begin.
    pub fn restore(&self, flushed: Address, head: Address, begin: Address) {
        let g = self.state.geometry;
        self.state.tail.store(
            PageOffset::new(g.page_of(flushed) as u32, g.offset_of(flushed)),
            Ordering::Release,
        );
        self.state.begin_address.store(begin, Ordering::Release);
        self.state.head_address.store(head, Ordering::Release);
        self.state.safe_head_address.store(head, Ordering::Release);
        self.state.read_only_address.store(flushed, Ordering::Release);
        self.state
            .flushed_until_address
            .store(flushed, Ordering::Release);
    }

    /// Pointer into the page backing `addr`.
    ///
    /// # Safety
    ///
    /// Valid only while the caller is resumed in the epoch manager and `addr`
    /// is at or above the safe head.
    #[inline]
    pub unsafe fn get_physical(&self, addr: Address) -> NonNull<u8> {
        debug_assert!(addr >= self.safe_head_address());
        self.ring.ptr_at(addr)
    }

    /// Stop the flush worker. Pending requests are drained first.
    pub(crate) fn shutdown(&self) {
        self.flush.stop();
    }
}

// Safety: shared state is atomics and epoch-coordinated page buffers.
unsafe impl<D: StorageDevice> Send for LogAllocator<D> {}
unsafe impl<D: StorageDevice> Sync for LogAllocator<D> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NullDisk;

    fn test_allocator(page_size: usize, pages: u32) -> LogAllocator<NullDisk> {
        let geometry = LogGeometry::new(page_size, pages).unwrap();
        let begin = Arc::new(AtomicAddress::new(FIRST_VALID_ADDRESS));
        LogAllocator::new(
            geometry,
            Arc::new(NullDisk::new()),
            Arc::new(EpochManager::new()),
            begin,
            Box::new(|_| {}),
            Arc::new(|| {}),
        )
        .unwrap()
    }

    #[test]
    fn test_allocate_is_tail_monotonic() {
        let allocator = test_allocator(4096, 4);

        let a1 = allocator.try_allocate(100).unwrap();
        assert_eq!(a1, FIRST_VALID_ADDRESS);

        let a2 = allocator.try_allocate(100).unwrap();
        assert_eq!(a2, FIRST_VALID_ADDRESS + 100);

        assert_eq!(allocator.tail_address(), FIRST_VALID_ADDRESS + 200);
    }

    #[test]
    fn test_allocate_crosses_page_boundary() {
        let allocator = test_allocator(4096, 4);

        // Fill most of page 0, then force a crossing.
        allocator.try_allocate(4000).unwrap();
        let addr = allocator.try_allocate(200).unwrap();

        // The crossing allocation lands at the start of page 1.
        assert_eq!(addr.control(), 4096);
        assert_eq!(allocator.tail_address().control(), 4096 + 200);
    }

    #[test]
    fn test_allocate_backpressure_parks_tail() {
        // A device that rejects writes: flushed-until can never advance, so
        // crossing into page 2 keeps failing.
        struct FailingDisk;
        impl crate::device::SyncStorageDevice for FailingDisk {
            fn read_sync(&self, _offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
                buf.fill(0);
                Ok(buf.len())
            }
            fn write_sync(&self, _offset: u64, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("injected write failure"))
            }
            fn flush_sync(&self) -> std::io::Result<()> {
                Ok(())
            }
            fn truncate_sync(&self, _size: u64) -> std::io::Result<()> {
                Ok(())
            }
            fn size_sync(&self) -> std::io::Result<u64> {
                Ok(0)
            }
        }

        let geometry = LogGeometry::new(4096, 2).unwrap();
        let begin = Arc::new(AtomicAddress::new(FIRST_VALID_ADDRESS));
        let allocator = LogAllocator::new(
            geometry,
            Arc::new(FailingDisk),
            Arc::new(EpochManager::new()),
            begin,
            Box::new(|_| {}),
            Arc::new(|| {}),
        )
        .unwrap();

        allocator.try_allocate(4000).unwrap();
        allocator.try_allocate(4000).unwrap(); // opens page 1

        // Page 2's slot is page 0's, which can never flush.
        assert!(allocator.try_allocate(4000).is_none());

        // Tail parked at the page end; retries keep failing cleanly.
        assert_eq!(allocator.tail_address().control(), 2 * 4096);
        assert!(allocator.try_allocate(4000).is_none());
        assert_eq!(allocator.flushed_until_address(), FIRST_VALID_ADDRESS);
    }

    #[test]
    fn test_backpressure_releases_after_flush() {
        let allocator = test_allocator(4096, 2);

        allocator.try_allocate(4000).unwrap();
        allocator.try_allocate(4000).unwrap();

        // The worker flushes the sealed pages, advances the head, and the
        // parked transition eventually succeeds.
        let addr = loop {
            if let Some(addr) = allocator.try_allocate(4000) {
                break addr;
            }
            std::thread::yield_now();
        };
        assert_eq!(addr.control(), 2 * 4096);
    }

    #[test]
    fn test_geometry_math() {
        let g = LogGeometry::new(4096, 4).unwrap();
        assert_eq!(g.page_bits, 12);
        assert_eq!(g.page_of(Address::from_control(4096 * 3 + 5)), 3);
        assert_eq!(g.offset_of(Address::from_control(4096 * 3 + 5)), 5);
        assert_eq!(g.page_start(2).control(), 8192);
    }

    #[test]
    fn test_geometry_rejects_bad_config() {
        assert!(LogGeometry::new(4095, 4).is_err());
        assert!(LogGeometry::new(4096, 1).is_err());
    }

    #[test]
    fn test_restore_positions_tail() {
        let allocator = test_allocator(4096, 4);

        let flushed = Address::from_control(4096 + 512);
        let head = Address::from_control(4096);
        let begin = Address::from_control(64);
        allocator.restore(flushed, head, begin);

        assert_eq!(allocator.tail_address(), flushed);
        assert_eq!(allocator.flushed_until_address(), flushed);
        assert_eq!(allocator.begin_address(), begin);
        assert_eq!(allocator.head_address(), head);

        // Next allocation continues from the restored tail.
        let addr = allocator.try_allocate(8).unwrap();
        assert_eq!(addr, flushed);
    }

    #[test]
    fn test_shift_begin_address_is_monotone() {
        let allocator = test_allocator(4096, 4);

        allocator.shift_begin_address(Address::from_control(1000));
        assert_eq!(allocator.begin_address().control(), 1000);

        allocator.shift_begin_address(Address::from_control(500));
        assert_eq!(allocator.begin_address().control(), 1000);
    }
}
