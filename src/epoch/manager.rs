//! Epoch manager: deferred reclamation for shared page memory.
//!
//! Producers and the flush worker share ring pages without locks. A thread
//! resumes into the current epoch before dereferencing page memory and
//! suspends when done; work that must wait for every thread present at some
//! instant to move on (flush-range copies after a read-only shift, ring slot
//! reuse after a head advance) is handed to [`EpochManager::defer`], which
//! retires the current epoch and runs the action once no thread remains
//! resumed in it or an earlier one.
//!
//! The resume/suspend fast path is one atomic store per side on a
//! cache-line-private slot. Deferred actions arrive at page-seal and
//! head-advance cadence, orders of magnitude rarer than appends, so the
//! queue behind them is a plain mutex-guarded vector rather than a lock-free
//! structure; resumers only touch it when the pending counter is non-zero.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::constants::{CACHE_LINE_BYTES, MAX_THREADS};
use crate::status::Status;

// ============ Thread ID Allocation ============

struct ThreadIdPool {
    next: usize,
    free: Vec<usize>,
}

static THREAD_IDS: OnceLock<Mutex<ThreadIdPool>> = OnceLock::new();

fn thread_id_pool() -> &'static Mutex<ThreadIdPool> {
    THREAD_IDS.get_or_init(|| {
        Mutex::new(ThreadIdPool {
            next: 0,
            free: Vec::new(),
        })
    })
}

struct ThreadIdGuard {
    id: usize,
}

impl Drop for ThreadIdGuard {
    fn drop(&mut self) {
        thread_id_pool().lock().free.push(self.id);
    }
}

thread_local! {
    static THREAD_ID: RefCell<Option<ThreadIdGuard>> = const { RefCell::new(None) };
}

/// Get the current thread's ID for epoch protection.
///
/// The ID is an index into the epoch slot table, allocated on first call,
/// constant for the thread's lifetime, and recycled when the thread exits.
/// Registration is once per thread, so the pool is a plain locked free list.
///
/// # Errors
///
/// Returns `Status::TooManyThreads` if more than `MAX_THREADS` threads
/// concurrently use the library.
#[inline]
pub fn get_thread_id() -> Result<usize, Status> {
    try_get_thread_id().ok_or(Status::TooManyThreads)
}

/// Try to get the current thread's ID for epoch protection.
#[inline]
pub fn try_get_thread_id() -> Option<usize> {
    THREAD_ID.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(guard) = slot.as_ref() {
            return Some(guard.id);
        }

        let mut pool = thread_id_pool().lock();
        let id = pool.free.pop().or_else(|| {
            (pool.next < MAX_THREADS).then(|| {
                let id = pool.next;
                pool.next += 1;
                id
            })
        })?;
        drop(pool);

        *slot = Some(ThreadIdGuard { id });
        Some(id)
    })
}

// ============ Epoch slots ============

/// Low bits of a slot word hold the reentrancy depth; the rest hold the
/// epoch the thread resumed in. Depth 0 (a zero word) means suspended.
const DEPTH_BITS: u32 = 16;
const DEPTH_MASK: u64 = (1 << DEPTH_BITS) - 1;

/// Per-thread epoch slot: `epoch << DEPTH_BITS | depth`, zero when
/// suspended. Only the owning thread writes its slot; peers read it during
/// retired-epoch scans. One cache line per slot keeps resumers from
/// bouncing lines off each other.
#[repr(C, align(64))]
struct Slot {
    state: AtomicU64,
    _padding: [u8; CACHE_LINE_BYTES - 8],
}

impl Slot {
    const fn new() -> Self {
        Self {
            state: AtomicU64::new(0),
            _padding: [0; CACHE_LINE_BYTES - 8],
        }
    }
}

/// An action waiting for its retired epoch to clear
struct Deferred {
    /// The epoch retired when the action was registered
    trigger: u64,
    run: Box<dyn FnOnce() + Send + 'static>,
}

/// Epoch protection for the log's shared page memory.
///
/// Tracks which threads are resumed and in which epoch, and defers cleanup
/// until every thread present at registration time has left that epoch.
pub struct EpochManager {
    /// Per-thread slots, indexed by [`get_thread_id`]
    slots: Box<[Slot]>,
    /// Current global epoch; bumped by each [`EpochManager::defer`]
    global_epoch: AtomicU64,
    /// Actions waiting on retired epochs, in registration order
    deferred: Mutex<Vec<Deferred>>,
    /// Mirror of the queue length so resumers skip the lock when idle
    deferred_count: AtomicU32,
}

impl EpochManager {
    /// Create a new epoch manager
    pub fn new() -> Self {
        let slots = (0..MAX_THREADS)
            .map(|_| Slot::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            global_epoch: AtomicU64::new(1),
            deferred: Mutex::new(Vec::new()),
            deferred_count: AtomicU32::new(0),
        }
    }

    /// Mark the calling thread present in the current epoch.
    ///
    /// Nests: a thread already resumed stays in its original epoch and only
    /// its depth grows. The outermost resume also runs any deferred actions
    /// whose epoch has cleared. Returns the epoch the thread is resumed in.
    #[inline]
    pub fn resume(&self, thread_id: usize) -> u64 {
        debug_assert!(thread_id < MAX_THREADS);
        let slot = &self.slots[thread_id];
        let word = slot.state.load(Ordering::Relaxed);

        if word == 0 {
            let epoch = self.global_epoch.load(Ordering::Acquire);
            slot.state.store(epoch << DEPTH_BITS | 1, Ordering::Release);
            if self.deferred_count.load(Ordering::Acquire) > 0 {
                self.run_ready();
            }
            epoch
        } else {
            debug_assert!(word & DEPTH_MASK < DEPTH_MASK);
            slot.state.store(word + 1, Ordering::Release);
            word >> DEPTH_BITS
        }
    }

    /// Mark the calling thread absent.
    ///
    /// Must pair with [`EpochManager::resume`]; the thread leaves its epoch
    /// when the outermost pair closes.
    #[inline]
    pub fn suspend(&self, thread_id: usize) {
        debug_assert!(thread_id < MAX_THREADS);
        let slot = &self.slots[thread_id];
        let word = slot.state.load(Ordering::Relaxed);
        debug_assert!(word & DEPTH_MASK > 0);

        let next = if word & DEPTH_MASK == 1 { 0 } else { word - 1 };
        slot.state.store(next, Ordering::Release);
    }

    /// Whether the thread is currently resumed
    #[inline]
    pub fn is_resumed(&self, thread_id: usize) -> bool {
        debug_assert!(thread_id < MAX_THREADS);
        self.slots[thread_id].state.load(Ordering::Acquire) != 0
    }

    /// Retire the current epoch and run `action` once every thread resumed
    /// in it (or earlier) has suspended.
    ///
    /// Actions run during some later [`EpochManager::resume`] or
    /// [`EpochManager::pump`], on whichever thread performs it.
    pub fn defer<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let retired = self.global_epoch.fetch_add(1, Ordering::AcqRel);
        let mut pending = self.deferred.lock();
        pending.push(Deferred {
            trigger: retired,
            run: Box::new(action),
        });
        self.deferred_count
            .store(pending.len() as u32, Ordering::Release);
    }

    /// Resume, run cleared deferred actions, and suspend in one step.
    ///
    /// Spin loops and the flush worker call this to keep deferred work
    /// moving while they wait.
    #[inline]
    pub fn pump(&self, thread_id: usize) {
        self.resume(thread_id);
        self.suspend(thread_id);
    }

    /// Number of deferred actions not yet run
    #[inline]
    pub fn pending_actions(&self) -> u32 {
        self.deferred_count.load(Ordering::Acquire)
    }

    /// Current global epoch value
    #[inline]
    pub fn current_epoch(&self) -> u64 {
        self.global_epoch.load(Ordering::Acquire)
    }

    /// Newest epoch no thread is resumed in or before
    fn cleared_epoch(&self) -> u64 {
        let mut oldest = self.global_epoch.load(Ordering::Acquire);
        for slot in self.slots.iter() {
            let word = slot.state.load(Ordering::Acquire);
            if word != 0 {
                oldest = oldest.min(word >> DEPTH_BITS);
            }
        }
        oldest.saturating_sub(1)
    }

    /// Pop and run every deferred action whose epoch has cleared.
    ///
    /// Actions can be registered out of trigger order when two defers race,
    /// so the whole queue is sifted rather than just its front. Ready
    /// actions run outside the lock in registration order.
    fn run_ready(&self) {
        let cleared = self.cleared_epoch();

        let ready = {
            let mut pending = self.deferred.lock();
            let mut ready = Vec::new();
            let mut i = 0;
            while i < pending.len() {
                if pending[i].trigger <= cleared {
                    ready.push(pending.remove(i));
                } else {
                    i += 1;
                }
            }
            self.deferred_count
                .store(pending.len() as u32, Ordering::Release);
            ready
        };

        for deferred in ready {
            (deferred.run)();
        }
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII pair of [`EpochManager::resume`] / [`EpochManager::suspend`]
pub struct EpochGuard<'a> {
    epoch: &'a EpochManager,
    thread_id: usize,
}

impl<'a> EpochGuard<'a> {
    /// Resume; suspends when the guard drops
    pub fn new(epoch: &'a EpochManager, thread_id: usize) -> Self {
        epoch.resume(thread_id);
        Self { epoch, thread_id }
    }

    /// Get the thread ID
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.epoch.suspend(self.thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_resume_and_suspend() {
        let epoch = EpochManager::new();

        assert!(!epoch.is_resumed(0));

        let e = epoch.resume(0);
        assert_eq!(e, 1);
        assert!(epoch.is_resumed(0));

        epoch.suspend(0);
        assert!(!epoch.is_resumed(0));
    }

    #[test]
    fn test_nested_resume_keeps_epoch() {
        let epoch = EpochManager::new();

        let outer = epoch.resume(0);

        // A defer bumps the global epoch, but the nested resume stays in the
        // epoch of the outermost one.
        epoch.defer(|| {});
        let inner = epoch.resume(0);
        assert_eq!(inner, outer);

        epoch.suspend(0);
        assert!(epoch.is_resumed(0));

        epoch.suspend(0);
        assert!(!epoch.is_resumed(0));
    }

    #[test]
    fn test_defer_runs_when_idle() {
        let epoch = EpochManager::new();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        epoch.defer(move || flag.store(true, Ordering::Release));
        assert_eq!(epoch.pending_actions(), 1);

        // Nobody is resumed, so one pump clears the retired epoch.
        epoch.pump(0);

        assert!(ran.load(Ordering::Acquire));
        assert_eq!(epoch.pending_actions(), 0);
    }

    #[test]
    fn test_defer_waits_for_resumed_thread() {
        let epoch = EpochManager::new();
        let ran = Arc::new(AtomicBool::new(false));

        // Thread 1 is resumed when the action registers; the action must
        // wait until it suspends.
        epoch.resume(1);

        let flag = Arc::clone(&ran);
        epoch.defer(move || flag.store(true, Ordering::Release));

        epoch.pump(0);
        assert!(!ran.load(Ordering::Acquire));

        epoch.suspend(1);
        epoch.pump(0);
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn test_late_resumer_does_not_block_earlier_defer() {
        let epoch = EpochManager::new();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        epoch.defer(move || flag.store(true, Ordering::Release));

        // Thread 2 resumes after the defer retired its epoch; it cannot hold
        // a reference from the retired epoch, so the action still runs.
        let resumed_in = epoch.resume(2);
        assert!(resumed_in > 1);
        assert!(ran.load(Ordering::Acquire));

        epoch.suspend(2);
    }

    #[test]
    fn test_defers_run_in_registration_order() {
        let epoch = EpochManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            epoch.defer(move || order.lock().push(i));
        }

        epoch.pump(0);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_epoch_guard_pairs_resume_suspend() {
        let epoch = EpochManager::new();

        {
            let guard = EpochGuard::new(&epoch, 0);
            assert_eq!(guard.thread_id(), 0);
            assert!(epoch.is_resumed(0));
        }

        assert!(!epoch.is_resumed(0));
    }

    #[test]
    fn test_thread_id_recycling_under_churn() {
        for _ in 0..(MAX_THREADS * 2) {
            std::thread::spawn(|| {
                let id = get_thread_id().unwrap();
                assert!(id < MAX_THREADS);
            })
            .join()
            .unwrap();
        }
    }
}
