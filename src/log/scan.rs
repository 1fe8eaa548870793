//! Scan iterators over committed records.

use std::collections::VecDeque;

use tracing::warn;

use crate::address::Address;
use crate::device::StorageDevice;
use crate::log::blocking::IoExecutor;
use crate::log::page_log::LogInner;
use crate::record;

/// Page look-ahead policy for scans
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanBuffering {
    /// Keep one page in memory
    SinglePage,
    /// Keep the current page and eagerly load its successor
    DoublePage,
}

struct LoadedPage {
    page: u64,
    /// Committed coverage of this copy within the page; a copy is stale once
    /// commits extend past it, because later offsets were zeros at load time
    covered: Address,
    data: Vec<u8>,
}

/// Iterator over records in a log range, in address order.
///
/// Records are read from the device page by page and never yielded past the
/// live committed watermark: the iterator follows the tail as commits land.
pub struct LogScanIterator<'a, D: StorageDevice> {
    inner: &'a LogInner<D>,
    executor: Option<IoExecutor>,
    current: Address,
    end: Address,
    buffering: ScanBuffering,
    /// Loaded pages, front = page containing `current`
    loaded: VecDeque<LoadedPage>,
    done: bool,
}

impl<'a, D: StorageDevice> LogScanIterator<'a, D> {
    pub(crate) fn new(
        inner: &'a LogInner<D>,
        begin: Address,
        end: Address,
        buffering: ScanBuffering,
    ) -> Self {
        let executor = match IoExecutor::new() {
            Ok(executor) => Some(executor),
            Err(e) => {
                warn!("scan iterator could not build an I/O executor: {e}");
                None
            }
        };
        Self {
            inner,
            executor,
            current: begin,
            end,
            buffering,
            loaded: VecDeque::new(),
            done: false,
        }
    }

    /// Address of the next record the iterator would decode
    pub fn current_address(&self) -> Address {
        self.current
    }

    fn load_page(&mut self, page: u64) -> Option<Vec<u8>> {
        let executor = self.executor.as_ref()?;
        let g = self.inner.geometry;
        let start = g.page_start(page).control();
        let mut data = vec![0u8; g.page_size as usize];

        let device = self.inner.allocator.device();
        match executor.block_on(device.read(start, &mut data)) {
            // A short read leaves zeros, which decode as page padding.
            Ok(_) => Some(data),
            Err(e) => {
                warn!("scan read failed for page {page}: {e}");
                None
            }
        }
    }

    /// Ensure a fresh-enough copy of `page` is at the front; prefetch its
    /// successor under double buffering.
    fn ensure_page(&mut self, page: u64, limit: Address) -> bool {
        let g = self.inner.geometry;
        let covered = limit.min(g.page_start(page + 1));

        while matches!(self.loaded.front(), Some(p) if p.page < page) {
            self.loaded.pop_front();
        }

        let fresh = matches!(
            self.loaded.front(),
            Some(p) if p.page == page && p.covered >= covered
        );
        if !fresh {
            if matches!(self.loaded.front(), Some(p) if p.page == page) {
                // A tail-following scan outlived this copy: commits extended
                // into the page after it was read.
                self.loaded.pop_front();
            } else {
                self.loaded.clear();
            }
            let Some(data) = self.load_page(page) else {
                return false;
            };
            self.loaded.push_front(LoadedPage {
                page,
                covered,
                data,
            });
        }

        if self.buffering == ScanBuffering::DoublePage && self.loaded.len() < 2 {
            let next = page + 1;
            if g.page_start(next) < limit {
                if let Some(data) = self.load_page(next) {
                    self.loaded.push_back(LoadedPage {
                        page: next,
                        covered: limit.min(g.page_start(next + 1)),
                        data,
                    });
                }
            }
        }
        true
    }
}

impl<D: StorageDevice> Iterator for LogScanIterator<'_, D> {
    type Item = (Address, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let g = self.inner.geometry;
        let page_size = g.page_size as usize;

        loop {
            let limit = self.end.min(self.inner.committer.committed_until());
            if self.current + record::HEADER_SIZE as u64 > limit {
                return None;
            }

            let page = g.page_of(self.current);
            let offset = g.offset_of(self.current) as usize;

            // A header cannot start this close to the page end.
            if offset + record::HEADER_SIZE > page_size {
                self.current = g.page_start(page + 1);
                continue;
            }

            if !self.ensure_page(page, limit) {
                self.done = true;
                return None;
            }
            let data = &self.loaded.front().expect("page just ensured").data;

            let length = record::read_length(&data[offset..])? as usize;
            if length == 0 {
                // Zeroed page-end padding; the stream continues on the next
                // page.
                self.current = g.page_start(page + 1);
                continue;
            }

            let total = record::entry_size(length);
            if length > page_size - record::HEADER_SIZE || offset + total > page_size {
                warn!("corrupt record at {}: length {length}", self.current);
                self.done = true;
                return None;
            }
            if self.current + total as u64 > limit {
                // Fully committed records never dangle past the watermark;
                // wait for the commit covering this one.
                return None;
            }

            let payload =
                data[offset + record::HEADER_SIZE..offset + record::HEADER_SIZE + length].to_vec();
            let addr = self.current;
            self.current += total as u64;
            return Some((addr, payload));
        }
    }
}
