//! TANDEM - Buffer Pool
//! A fixed-capacity LRU cache of pages over a `PageFile`.
//!
//! ## Eviction
//! - The victim is the least-recently-used page with a pin count of zero
//! - A dirty victim is written back before it leaves the cache
//! - If every frame is pinned the request fails with `PoolExhausted`,
//!   which callers may retry after other holders unpin

use std::ops::Deref;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{Result, TandemError};

use super::page::{Page, PageFile, PageId, PAGE_SIZE};

/// Page cache with pin-aware LRU eviction.
///
/// Lock order is always `frames` then `file`.
pub struct BufferPool {
    capacity: usize,
    frames: Mutex<LruCache<PageId, Arc<Page>>>,
    file: Mutex<PageFile>,
}

/// A pinned page. The pin is released when the guard is dropped.
#[derive(Debug)]
pub struct PinnedPage {
    page: Arc<Page>,
}

impl PinnedPage {
    /// Release the pin now rather than at end of scope.
    pub fn unpin(self) {}
}

impl Deref for PinnedPage {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.page
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.page.unpin();
    }
}

impl BufferPool {
    /// Create a pool of `capacity` frames over `file`.
    pub fn new(file: PageFile, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TandemError::Config(
                "buffer pool capacity must be at least 1".into(),
            ));
        }
        Ok(Self {
            capacity,
            frames: Mutex::new(LruCache::unbounded()),
            file: Mutex::new(file),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cached pages with a non-zero pin count.
    pub fn pinned_count(&self) -> usize {
        self.frames
            .lock()
            .iter()
            .filter(|(_, page)| page.is_pinned())
            .count()
    }

    /// Whether `id` is currently resident, without touching recency.
    pub fn is_cached(&self, id: PageId) -> bool {
        self.frames.lock().contains(&id)
    }

    /// Number of pages in the backing file.
    pub fn file_page_count(&self) -> Result<u64> {
        self.file.lock().page_count()
    }

    /// Return the page pinned, loading it on a miss.
    pub fn get_page(&self, id: PageId) -> Result<PinnedPage> {
        let mut frames = self.frames.lock();

        if let Some(page) = frames.get(&id) {
            page.pin();
            return Ok(PinnedPage {
                page: Arc::clone(page),
            });
        }

        if frames.len() >= self.capacity {
            self.evict_one(&mut frames)?;
        }

        let mut buf = vec![0u8; PAGE_SIZE].into_boxed_slice();
        self.file.lock().read_page(id, &mut buf)?;
        let page = Arc::new(Page::from_bytes(id, buf));
        page.pin();
        frames.put(id, Arc::clone(&page));
        log::trace!("Buffer pool loaded page {}", id);

        Ok(PinnedPage { page })
    }

    /// Write a dirty page back to the file and clear its dirty flag.
    pub fn flush(&self, id: PageId) -> Result<()> {
        let frames = self.frames.lock();
        if let Some(page) = frames.peek(&id) {
            if page.is_dirty() {
                self.write_back(page)?;
            }
        }
        Ok(())
    }

    /// Write back every dirty page.
    pub fn flush_all(&self) -> Result<()> {
        let frames = self.frames.lock();
        for (_, page) in frames.iter() {
            if page.is_dirty() {
                self.write_back(page)?;
            }
        }
        Ok(())
    }

    /// fsync the backing file.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync()
    }

    fn evict_one(&self, frames: &mut LruCache<PageId, Arc<Page>>) -> Result<()> {
        let victim = frames
            .iter()
            .rev()
            .find(|(_, page)| !page.is_pinned())
            .map(|(id, page)| (*id, Arc::clone(page)));

        let (id, page) = victim.ok_or(TandemError::PoolExhausted {
            capacity: self.capacity,
        })?;

        if page.is_dirty() {
            // A failed write-back leaves the page cached and dirty.
            self.write_back(&page)?;
        }
        frames.pop(&id);
        log::debug!("Buffer pool evicted page {}", id);
        Ok(())
    }

    fn write_back(&self, page: &Page) -> Result<()> {
        // Holding the data lock across the write keeps a concurrent
        // writer's dirty mark ordered after our clean mark.
        let data = page.data();
        self.file.lock().write_page(page.id(), &data)?;
        page.mark_clean();
        Ok(())
    }
}
