//! TANDEM - Pages and the Page File
//! A page is the unit of caching and I/O: a fixed 4096-byte buffer
//! with a dirty flag and a pin count.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};

use crate::error::{Result, TandemError};

/// Size of every page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Page number within a page file.
pub type PageId = u64;

/// A cached page frame.
///
/// The buffer is behind a lock so pinned holders can read and write
/// concurrently with each other; the pin count and dirty flag are atomics
/// so the pool can inspect them while deciding on a victim.
#[derive(Debug)]
pub struct Page {
    id: PageId,
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
    pin_count: AtomicU32,
}

impl Page {
    /// A zero-filled page.
    pub fn new(id: PageId) -> Self {
        Self::from_bytes(id, vec![0u8; PAGE_SIZE].into_boxed_slice())
    }

    pub(crate) fn from_bytes(id: PageId, data: Box<[u8]>) -> Self {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        Self {
            id,
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unpin(&self) {
        // Never underflow, even on a stray unpin.
        let _ = self
            .pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Copy `buf.len()` bytes starting at `offset` out of the page.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.data.read()[offset..offset + buf.len()]);
        Ok(())
    }

    /// Copy `bytes` into the page at `offset` and mark it dirty.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        check_bounds(offset, bytes.len())?;
        self.data.write()[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.mark_dirty();
        Ok(())
    }

    /// Borrow the whole buffer for reading.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.data.read()
    }
}

fn check_bounds(offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= PAGE_SIZE => Ok(()),
        _ => Err(TandemError::PageOverflow { offset, len }),
    }
}

/// A file made of `PAGE_SIZE` pages addressed by `PageId`.
pub struct PageFile {
    path: PathBuf,
    file: File,
}

impl PageFile {
    /// Open or create a page file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of whole pages currently stored in the file.
    pub fn page_count(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len() / PAGE_SIZE as u64)
    }

    /// Read a page. Pages past the end of the file read as zeroes.
    pub fn read_page(&mut self, id: PageId, buf: &mut [u8]) -> Result<()> {
        check_bounds(0, buf.len())?;
        buf.fill(0);
        let offset = id * PAGE_SIZE as u64;
        let len = self.file.metadata()?.len();
        if offset >= len {
            return Ok(());
        }
        let available = ((len - offset) as usize).min(buf.len());
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf[..available])?;
        Ok(())
    }

    /// Write a full page image.
    pub fn write_page(&mut self, id: PageId, buf: &[u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            return Err(TandemError::PageOverflow {
                offset: 0,
                len: buf.len(),
            });
        }
        self.file.seek(SeekFrom::Start(id * PAGE_SIZE as u64))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    /// fsync the file.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}
