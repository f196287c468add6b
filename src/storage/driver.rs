//! # Storage Driver Abstraction Layer
//!
//! This module provides the `StorageDriver` trait, a copy-based abstraction over
//! the backends a collection file can live on:
//!
//! | Backend       | Where          | Zero-Copy | Sync Required |
//! |---------------|----------------|-----------|---------------|
//! | MmapStorage   | Directory      | Yes       | msync         |
//! | MemoryStorage | Heap           | Yes       | No            |
//!
//! ## Copy-Based Interface
//!
//! Atomic operations keep their own copy of every page they touch, so the
//! primary interface copies pages in and out:
//!
//! ```text
//! fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<()>;
//! fn write_page(&mut self, page_no: u32, data: &[u8]) -> Result<()>;
//! ```
//!
//! Reads that do not need a private copy use `page_direct()` instead, which
//! returns a slice straight into the mapping or heap buffer.
//!
//! ## AnyStorage Enum
//!
//! `AnyStorage` is a type-erased wrapper that implements `StorageDriver`,
//! allowing `FileManager` to hold files of either backend without generics.
//!
//! ## Thread Safety
//!
//! `StorageDriver` requires `Send + Sync`. Both backends are wrapped in a
//! `parking_lot::RwLock` at the `FileManager` level.

use std::path::PathBuf;

use eyre::{ensure, Result};

use super::memory::MemoryStorage;
use super::mmap::MmapStorage;

/// Storage driver trait providing copy-based page access with a zero-copy
/// bypass for reads.
pub trait StorageDriver: Send + Sync {
    /// Reads a page into the provided buffer, which must be one page long.
    fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<()>;

    /// Writes a page from the provided buffer. Changes may be buffered until
    /// `sync()` is called.
    fn write_page(&mut self, page_no: u32, data: &[u8]) -> Result<()>;

    /// Extends the storage to accommodate the specified number of pages.
    ///
    /// If `new_page_count` is less than or equal to current page count, this is a no-op.
    fn grow(&mut self, new_page_count: u32) -> Result<()>;

    fn page_count(&self) -> u32;

    fn page_size(&self) -> usize;

    /// Flushes all pending writes to durable storage.
    fn sync(&self) -> Result<()>;

    /// Returns a direct read-only reference to page data.
    fn page_direct(&self, page_no: u32) -> Result<&[u8]>;

    /// Hints that the specified page range will be accessed soon.
    fn prefetch(&self, _start_page: u32, _count: u32) {}
}

fn check_buffer(len: usize, page_size: usize) -> Result<()> {
    ensure!(
        len == page_size,
        "page buffer of {} bytes does not match page size {}",
        len,
        page_size
    );
    Ok(())
}

impl StorageDriver for MmapStorage {
    fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<()> {
        check_buffer(buf.len(), self.page_size())?;
        buf.copy_from_slice(self.page(page_no)?);
        Ok(())
    }

    fn write_page(&mut self, page_no: u32, data: &[u8]) -> Result<()> {
        check_buffer(data.len(), self.page_size())?;
        self.page_mut(page_no)?.copy_from_slice(data);
        Ok(())
    }

    fn grow(&mut self, new_page_count: u32) -> Result<()> {
        MmapStorage::grow(self, new_page_count)
    }

    fn page_count(&self) -> u32 {
        MmapStorage::page_count(self)
    }

    fn page_size(&self) -> usize {
        MmapStorage::page_size(self)
    }

    fn sync(&self) -> Result<()> {
        MmapStorage::sync(self)
    }

    fn page_direct(&self, page_no: u32) -> Result<&[u8]> {
        self.page(page_no)
    }

    fn prefetch(&self, start_page: u32, count: u32) {
        self.prefetch_pages(start_page, count)
    }
}

impl StorageDriver for MemoryStorage {
    fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<()> {
        check_buffer(buf.len(), self.page_size())?;
        buf.copy_from_slice(self.page(page_no)?);
        Ok(())
    }

    fn write_page(&mut self, page_no: u32, data: &[u8]) -> Result<()> {
        check_buffer(data.len(), self.page_size())?;
        self.page_mut(page_no)?.copy_from_slice(data);
        Ok(())
    }

    fn grow(&mut self, new_page_count: u32) -> Result<()> {
        MemoryStorage::grow(self, new_page_count);
        Ok(())
    }

    fn page_count(&self) -> u32 {
        MemoryStorage::page_count(self)
    }

    fn page_size(&self) -> usize {
        MemoryStorage::page_size(self)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn page_direct(&self, page_no: u32) -> Result<&[u8]> {
        self.page(page_no)
    }
}

/// Where the files of a `FileManager` live.
#[derive(Debug, Clone)]
pub enum StorageKind {
    /// Memory-mapped files inside a directory.
    Mmap { path: PathBuf },

    /// Heap-backed files that vanish with the manager.
    Memory,
}

impl StorageKind {
    pub fn mmap<P: Into<PathBuf>>(path: P) -> Self {
        StorageKind::Mmap { path: path.into() }
    }

    pub fn is_mmap(&self) -> bool {
        matches!(self, StorageKind::Mmap { .. })
    }

    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            StorageKind::Mmap { path } => Some(path),
            StorageKind::Memory => None,
        }
    }
}

/// Type-erased storage backend that implements `StorageDriver`.
#[derive(Debug)]
pub enum AnyStorage {
    Mmap(MmapStorage),
    Memory(MemoryStorage),
}

impl AnyStorage {
    pub fn is_mmap(&self) -> bool {
        matches!(self, AnyStorage::Mmap(_))
    }
}

impl StorageDriver for AnyStorage {
    fn read_page(&self, page_no: u32, buf: &mut [u8]) -> Result<()> {
        match self {
            AnyStorage::Mmap(s) => s.read_page(page_no, buf),
            AnyStorage::Memory(s) => s.read_page(page_no, buf),
        }
    }

    fn write_page(&mut self, page_no: u32, data: &[u8]) -> Result<()> {
        match self {
            AnyStorage::Mmap(s) => s.write_page(page_no, data),
            AnyStorage::Memory(s) => s.write_page(page_no, data),
        }
    }

    fn grow(&mut self, new_page_count: u32) -> Result<()> {
        match self {
            AnyStorage::Mmap(s) => StorageDriver::grow(s, new_page_count),
            AnyStorage::Memory(s) => StorageDriver::grow(s, new_page_count),
        }
    }

    fn page_count(&self) -> u32 {
        match self {
            AnyStorage::Mmap(s) => StorageDriver::page_count(s),
            AnyStorage::Memory(s) => StorageDriver::page_count(s),
        }
    }

    fn page_size(&self) -> usize {
        match self {
            AnyStorage::Mmap(s) => StorageDriver::page_size(s),
            AnyStorage::Memory(s) => StorageDriver::page_size(s),
        }
    }

    fn sync(&self) -> Result<()> {
        match self {
            AnyStorage::Mmap(s) => StorageDriver::sync(s),
            AnyStorage::Memory(s) => StorageDriver::sync(s),
        }
    }

    fn page_direct(&self, page_no: u32) -> Result<&[u8]> {
        match self {
            AnyStorage::Mmap(s) => s.page_direct(page_no),
            AnyStorage::Memory(s) => s.page_direct(page_no),
        }
    }

    fn prefetch(&self, start_page: u32, count: u32) {
        match self {
            AnyStorage::Mmap(s) => s.prefetch(start_page, count),
            AnyStorage::Memory(s) => s.prefetch(start_page, count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn storage_kind_mmap_path_accessor() {
        let kind = StorageKind::mmap("/tmp/collections");

        assert!(kind.is_mmap());
        assert_eq!(kind.path(), Some(&PathBuf::from("/tmp/collections")));
        assert_eq!(StorageKind::Memory.path(), None);
    }

    fn exercise(storage: &mut AnyStorage) {
        storage.grow(2).unwrap();
        assert_eq!(storage.page_count(), 2);

        let mut page = vec![0u8; storage.page_size()];
        page[3] = 0x77;
        storage.write_page(1, &page).unwrap();

        let mut read = vec![0u8; storage.page_size()];
        storage.read_page(1, &mut read).unwrap();
        assert_eq!(read[3], 0x77);
        assert_eq!(storage.page_direct(1).unwrap()[3], 0x77);

        let mut short = vec![0u8; 10];
        assert!(storage.read_page(1, &mut short).is_err());
        assert!(storage.write_page(5, &page).is_err());
        storage.sync().unwrap();
    }

    #[test]
    fn memory_backend_round_trips_pages() {
        let mut storage = AnyStorage::Memory(MemoryStorage::new(1024));
        assert!(!storage.is_mmap());
        exercise(&mut storage);
    }

    #[test]
    fn mmap_backend_round_trips_pages() {
        let dir = tempdir().unwrap();
        let mut storage =
            AnyStorage::Mmap(MmapStorage::create(dir.path().join("t.pcl"), 1024).unwrap());
        assert!(storage.is_mmap());
        exercise(&mut storage);
    }
}
