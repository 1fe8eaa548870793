//! Background flush worker.
//!
//! Closed ranges of the ring are copied out (after the epoch drain that
//! guarantees producers finished writing them) and queued to a dedicated
//! worker thread, which writes them to the device, syncs, advances the
//! contiguous flushed-until watermark, and invokes the commit callback.
//!
//! The worker doubles as an epoch pump: deferred flush submissions and safe
//! head advances keep moving even when every producer is idle or parked.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::warn;

use crate::address::Address;
use crate::device::StorageDevice;
use crate::epoch::{try_get_thread_id, EpochManager};

use super::ring::{advance_head, PageRing, RingState};

/// Callback invoked with each new contiguous flushed-until address
pub(crate) type FlushCallback = Box<dyn Fn(Address) + Send + Sync>;

pub(crate) enum FlushRequest {
    Range { start: Address, data: Vec<u8> },
    Shutdown,
}

/// State shared with the worker thread
pub(crate) struct FlushShared<D: StorageDevice> {
    pub(crate) device: Arc<D>,
    pub(crate) state: Arc<RingState>,
    pub(crate) epoch: Arc<EpochManager>,
    pub(crate) on_flush: FlushCallback,
}

/// Copy the closed range `[from, to)` out of the ring and queue it for the
/// worker, split at page boundaries.
///
/// Runs as an epoch-deferred action: by now every producer that was writing
/// the range has suspended, and the slots cannot have been reused because
/// the range is not yet flushed.
pub(crate) fn submit_flush_ranges(
    state: &RingState,
    ring: &PageRing,
    tx: &Sender<FlushRequest>,
    from: Address,
    to: Address,
) {
    let g = state.geometry;
    let mut cursor = from;
    while cursor < to {
        let page_end = g.page_start(g.page_of(cursor) + 1);
        let end = to.min(page_end);
        let data = unsafe { ring.copy_range(cursor, end) };
        if tx
            .send(FlushRequest::Range {
                start: cursor,
                data,
            })
            .is_err()
        {
            warn!("flush worker gone; dropping range {cursor}..{end}");
            return;
        }
        cursor = end;
    }
}

/// Owns the worker thread and its request channel
pub(crate) struct FlushManager {
    tx: Sender<FlushRequest>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl FlushManager {
    pub(crate) fn new<D: StorageDevice>(shared: FlushShared<D>) -> Self {
        let (tx, rx) = unbounded::<FlushRequest>();
        let worker = thread::Builder::new()
            .name("pagelog-flush".into())
            .spawn(move || worker_loop(shared, rx))
            .expect("failed to spawn flush worker");

        Self {
            tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub(crate) fn sender(&self) -> Sender<FlushRequest> {
        self.tx.clone()
    }

    pub(crate) fn stop(&self) {
        if let Some(worker) = self.worker.lock().take() {
            let _ = self.tx.send(FlushRequest::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Drop for FlushManager {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WorkerState {
    /// Written-and-synced ranges keyed by start, pending contiguity
    completed: BTreeMap<u64, u64>,
    /// Ranges whose write failed; retried until the device recovers
    failed: Vec<(Address, Vec<u8>)>,
}

fn worker_loop<D: StorageDevice>(shared: FlushShared<D>, rx: Receiver<FlushRequest>) {
    let rt = match tokio::runtime::Builder::new_current_thread().build() {
        Ok(rt) => rt,
        Err(e) => {
            warn!("failed to start flush runtime: {e}");
            return;
        }
    };

    let mut ws = WorkerState {
        completed: BTreeMap::new(),
        failed: Vec::new(),
    };

    loop {
        match rx.recv_timeout(Duration::from_millis(5)) {
            Ok(FlushRequest::Range { start, data }) => {
                write_range(&rt, &shared, &mut ws, start, data);
            }
            Ok(FlushRequest::Shutdown) => {
                // Drain everything still queued before exiting.
                while let Ok(FlushRequest::Range { start, data }) = rx.try_recv() {
                    write_range(&rt, &shared, &mut ws, start, data);
                }
                retry_failed(&rt, &shared, &mut ws);
                if !ws.failed.is_empty() {
                    warn!(
                        "flush worker exiting with {} unflushed ranges",
                        ws.failed.len()
                    );
                }
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                // Keep deferred epoch work moving while idle.
                if let Some(tid) = try_get_thread_id() {
                    shared.epoch.pump(tid);
                }
                retry_failed(&rt, &shared, &mut ws);
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn retry_failed<D: StorageDevice>(
    rt: &tokio::runtime::Runtime,
    shared: &FlushShared<D>,
    ws: &mut WorkerState,
) {
    if ws.failed.is_empty() {
        return;
    }
    let pending = std::mem::take(&mut ws.failed);
    for (start, data) in pending {
        write_range(rt, shared, ws, start, data);
    }
}

fn write_range<D: StorageDevice>(
    rt: &tokio::runtime::Runtime,
    shared: &FlushShared<D>,
    ws: &mut WorkerState,
    start: Address,
    data: Vec<u8>,
) {
    let end = start + data.len() as u64;
    let result = rt.block_on(async {
        shared.device.write(start.control(), &data).await?;
        shared.device.flush().await
    });

    match result {
        Ok(()) => {
            ws.completed.insert(start.control(), end.control());
            advance_flushed(shared, ws);
        }
        Err(e) => {
            // The flushed-until watermark cannot pass this hole; the log
            // stalls for the range until the device recovers.
            warn!("flush failed for range {start}..{end}: {e}");
            ws.failed.push((start, data));
        }
    }
}

fn advance_flushed<D: StorageDevice>(shared: &FlushShared<D>, ws: &mut WorkerState) {
    let mut flushed = shared
        .state
        .flushed_until_address
        .load(std::sync::atomic::Ordering::Acquire)
        .control();

    let mut advanced = false;
    while let Some(end) = ws.completed.remove(&flushed) {
        flushed = end;
        advanced = true;
    }

    if advanced {
        let flushed = Address::from_control(flushed);
        shared.state.flushed_until_address.bump_to(flushed);
        advance_head(&shared.state, &shared.epoch);
        (shared.on_flush)(flushed);
    }
}
