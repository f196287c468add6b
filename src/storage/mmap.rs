//! # Memory-Mapped File Storage
//!
//! `MmapStorage` is the on-disk backend behind every collection file (data,
//! position map and free-space map). It provides zero-copy page access with
//! compile-time safety guarantees through Rust's borrow checker.
//!
//! ## Safety Considerations
//!
//! Memory-mapped regions become invalid when remapped (during `grow()`).
//! Rather than hazard pointers or epochs, the borrow checker does the work:
//!
//! ```text
//! page(&self) -> &[u8]              // Immutable borrow of self
//! page_mut(&mut self) -> &mut [u8]  // Mutable borrow of self
//! grow(&mut self)                   // Mutable borrow (exclusive)
//! ```
//!
//! Since `grow()` requires `&mut self`, no page reference can outlive a remap.
//!
//! ## Empty Files
//!
//! Collection files start empty: the first page is added by the atomic
//! operation that creates the file. A zero-length file cannot be mapped, so
//! the mapping is created lazily by the first `grow()`.
//!
//! ## File Format
//!
//! Files are concatenated pages of the collection's page size:
//!
//! ```text
//! Offset 0:              Page 0 (state page / entry point / first-level tree)
//! Offset page_size:      Page 1
//! Offset 2 * page_size:  Page 2
//! ...
//! ```
//!
//! The file size must always be a multiple of the page size.
//!
//! ## Error Handling
//!
//! All fallible operations return `eyre::Result` with the file path, the
//! operation and page numbers attached.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

#[derive(Debug)]
pub struct MmapStorage {
    file: File,
    mmap: Option<MmapMut>,
    page_size: usize,
    page_count: u32,
}

impl MmapStorage {
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open collection file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(
            file_size % page_size as u64 == 0,
            "collection file '{}' size {} is not a multiple of page size {}",
            path.display(),
            file_size,
            page_size
        );

        let page_count = (file_size / page_size as u64) as u32;

        let mmap = if page_count == 0 {
            None
        } else {
            // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can be
            // modified externally, leading to undefined behavior. This is safe because:
            // 1. The file is opened read+write and owned by this storage
            // 2. Collection files are not meant to be modified by external processes
            // 3. The mmap lifetime is tied to MmapStorage, preventing use-after-unmap
            // 4. All access goes through page()/page_mut() which bounds-check page_no
            Some(unsafe {
                MmapMut::map_mut(&file)
                    .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
            })
        };

        Ok(Self {
            file,
            mmap,
            page_size,
            page_count,
        })
    }

    /// Creates an empty file at `path`. Fails if it already exists.
    pub fn create<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create collection file '{}'", path.display()))?;

        Ok(Self {
            file,
            mmap: None,
            page_size,
            page_count: 0,
        })
    }

    pub fn page(&self, page_no: u32) -> Result<&[u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );

        let mmap = self
            .mmap
            .as_ref()
            .ok_or_else(|| eyre::eyre!("collection file is not mapped"))?;
        let offset = page_no as usize * self.page_size;
        Ok(&mmap[offset..offset + self.page_size])
    }

    pub fn page_mut(&mut self, page_no: u32) -> Result<&mut [u8]> {
        ensure!(
            page_no < self.page_count,
            "page {} out of bounds (page_count={})",
            page_no,
            self.page_count
        );

        let page_size = self.page_size;
        let mmap = self
            .mmap
            .as_mut()
            .ok_or_else(|| eyre::eyre!("collection file is not mapped"))?;
        let offset = page_no as usize * page_size;
        Ok(&mut mmap[offset..offset + page_size])
    }

    pub fn grow(&mut self, new_page_count: u32) -> Result<()> {
        if new_page_count <= self.page_count {
            return Ok(());
        }

        if let Some(mmap) = &self.mmap {
            mmap.flush().wrap_err("failed to flush mmap before grow")?;
        }

        let new_size = new_page_count as u64 * self.page_size as u64;

        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_size))?;

        // SAFETY: MmapMut::map_mut is unsafe because the old mmap becomes invalid.
        // This is safe because:
        // 1. grow() requires &mut self, so no page references can exist (borrow checker)
        // 2. We flushed the old mmap above, ensuring data is written to disk
        // 3. The file was extended to new_size before remapping
        // 4. The old mmap is dropped when we assign the new one
        self.mmap = Some(unsafe {
            MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")?
        });

        self.page_count = new_page_count;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        match &self.mmap {
            Some(mmap) => mmap.flush().wrap_err("failed to sync mmap to disk"),
            None => Ok(()),
        }
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn file_size(&self) -> u64 {
        self.page_count as u64 * self.page_size as u64
    }

    pub fn prefetch_pages(&self, start_page: u32, count: u32) {
        if start_page >= self.page_count {
            return;
        }

        let Some(mmap) = &self.mmap else {
            return;
        };

        let end_page = start_page.saturating_add(count).min(self.page_count);
        let start_offset = start_page as usize * self.page_size;
        let len = (end_page - start_page) as usize * self.page_size;

        #[cfg(unix)]
        // SAFETY: madvise with MADV_WILLNEED is a hint to the kernel and does not
        // cause undefined behavior even if the memory region is invalid. However,
        // this is safe because:
        // 1. start_page was bounds-checked above (start_page >= self.page_count returns early)
        // 2. end_page is clamped to self.page_count, so we never exceed the mmap bounds
        // 3. start_offset + len is at most self.page_count * page_size = file_size
        // 4. The mmap is valid for the entire file size
        unsafe {
            libc::madvise(
                mmap.as_ptr().add(start_offset) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }

        #[cfg(not(unix))]
        let _ = (mmap, start_offset, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: usize = 2048;

    #[test]
    fn create_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.pcl");

        let storage = MmapStorage::create(&path, PAGE).unwrap();

        assert_eq!(storage.page_count(), 0);
        assert_eq!(storage.file_size(), 0);
        assert!(storage.page(0).is_err());
        assert!(storage.sync().is_ok());
    }

    #[test]
    fn create_fails_when_file_exists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.pcl");

        MmapStorage::create(&path, PAGE).unwrap();
        let result = MmapStorage::create(&path, PAGE);

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("failed to create collection file"));
    }

    #[test]
    fn open_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.pcl");

        {
            let mut storage = MmapStorage::create(&path, PAGE).unwrap();
            storage.grow(5).unwrap();
            let page = storage.page_mut(0).unwrap();
            page[0] = 0xAB;
            storage.sync().unwrap();
        }

        let storage = MmapStorage::open(&path, PAGE).unwrap();

        assert_eq!(storage.page_count(), 5);
        assert_eq!(storage.page(0).unwrap()[0], 0xAB);
    }

    #[test]
    fn open_empty_file_has_no_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.fsm");
        MmapStorage::create(&path, PAGE).unwrap();

        let storage = MmapStorage::open(&path, PAGE).unwrap();

        assert_eq!(storage.page_count(), 0);
    }

    #[test]
    fn open_rejects_size_not_multiple_of_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.cpm");
        std::fs::write(&path, vec![0u8; PAGE + 1]).unwrap();

        let result = MmapStorage::open(&path, PAGE);

        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("not a multiple of page size"));
    }

    #[test]
    fn open_fails_for_nonexistent_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.pcl");

        assert!(MmapStorage::open(&path, PAGE).is_err());
    }

    #[test]
    fn grow_preserves_existing_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.pcl");

        let mut storage = MmapStorage::create(&path, PAGE).unwrap();
        storage.grow(3).unwrap();

        {
            let page = storage.page_mut(2).unwrap();
            page[0] = 0xCA;
            page[PAGE - 1] = 0xFE;
        }

        storage.grow(10).unwrap();

        assert_eq!(storage.page_count(), 10);
        assert_eq!(storage.file_size(), 10 * PAGE as u64);
        let page = storage.page(2).unwrap();
        assert_eq!(page[0], 0xCA);
        assert_eq!(page[PAGE - 1], 0xFE);
        assert!(storage.page(9).is_ok());
        assert!(storage.page(10).is_err());
    }

    #[test]
    fn grow_with_same_size_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.pcl");

        let mut storage = MmapStorage::create(&path, PAGE).unwrap();
        storage.grow(5).unwrap();
        storage.grow(5).unwrap();
        storage.grow(3).unwrap();

        assert_eq!(storage.page_count(), 5);
    }

    #[test]
    fn prefetch_is_harmless_out_of_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("users.pcl");

        let mut storage = MmapStorage::create(&path, PAGE).unwrap();
        storage.prefetch_pages(0, 4);
        storage.grow(2).unwrap();
        storage.prefetch_pages(1, 100);
        storage.prefetch_pages(7, 1);
    }
}
