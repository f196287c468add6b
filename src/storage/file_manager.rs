//! # Collection File Manager
//!
//! `FileManager` owns every open collection file and hands out stable
//! `FileId`s for them. Each collection is a triplet of files living side by
//! side in one directory:
//!
//! ```text
//! storage_dir/
//! ├── users.pcl    # Data pages (page 0: collection state)
//! ├── users.cpm    # Position map (page 0: entry point, 1..: buckets)
//! ├── users.fsm    # Free-space map (page 0: first level, 1..: second level)
//! └── orders.pcl   # ...
//! ```
//!
//! ## Storage Kinds
//!
//! - `StorageKind::Mmap`: files are memory-mapped from the directory.
//! - `StorageKind::Memory`: files are heap buffers. Closing a memory file
//!   parks its pages under its name so a later `open_file` finds them again,
//!   mimicking a directory that outlives the open handle.
//!
//! ## Thread Safety
//!
//! The file table sits behind a `parking_lot::RwLock`; each file is an
//! `Arc<RwLock<AnyStorage>>` so page readers on different files never
//! contend. Callers look storages up per access and do not hold the `Arc`
//! across operations, which lets `close_file` reclaim memory files.
//!
//! ## Usage Example
//!
//! ```ignore
//! let files = FileManager::open("./collections", 16384)?;
//! let id = files.add_file("users.pcl")?;
//! files.storage(id)?.write().grow(1)?;
//! files.rename_file(id, "people.pcl")?;
//! files.close_file(id, true)?;
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::driver::{AnyStorage, StorageDriver, StorageKind};
use super::memory::MemoryStorage;
use super::mmap::MmapStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u32);

impl FileId {
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

#[derive(Debug)]
struct OpenFile {
    name: String,
    storage: Arc<RwLock<AnyStorage>>,
}

#[derive(Debug, Default)]
struct FileTable {
    next_id: u32,
    open: HashMap<FileId, OpenFile>,
    by_name: HashMap<String, FileId>,
    parked: HashMap<String, MemoryStorage>,
}

impl FileTable {
    fn register(&mut self, name: &str, storage: AnyStorage) -> FileId {
        let id = FileId(self.next_id);
        self.next_id += 1;
        self.open.insert(
            id,
            OpenFile {
                name: name.to_string(),
                storage: Arc::new(RwLock::new(storage)),
            },
        );
        self.by_name.insert(name.to_string(), id);
        id
    }

    fn get(&self, id: FileId) -> Result<&OpenFile> {
        self.open
            .get(&id)
            .ok_or_else(|| eyre::eyre!("file {:?} is not open", id))
    }
}

#[derive(Debug)]
pub struct FileManager {
    storage_kind: StorageKind,
    page_size: usize,
    table: RwLock<FileTable>,
}

impl FileManager {
    /// Opens (creating if needed) a directory of memory-mapped collection files.
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> Result<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path).wrap_err_with(|| {
            format!("failed to create storage directory '{}'", path.display())
        })?;

        Ok(Self {
            storage_kind: StorageKind::mmap(path),
            page_size,
            table: RwLock::new(FileTable::default()),
        })
    }

    pub fn in_memory(page_size: usize) -> Self {
        Self {
            storage_kind: StorageKind::Memory,
            page_size,
            table: RwLock::new(FileTable::default()),
        }
    }

    pub fn storage_kind(&self) -> &StorageKind {
        &self.storage_kind
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn open_file_count(&self) -> usize {
        self.table.read().open.len()
    }

    fn file_path(&self, name: &str) -> Option<PathBuf> {
        self.storage_kind.path().map(|dir| dir.join(name))
    }

    pub fn exists(&self, name: &str) -> bool {
        let table = self.table.read();
        if table.by_name.contains_key(name) || table.parked.contains_key(name) {
            return true;
        }
        self.file_path(name).is_some_and(|path| path.exists())
    }

    /// Creates a new, empty file. Fails if a file with that name exists.
    pub fn add_file(&self, name: &str) -> Result<FileId> {
        Self::validate_name(name)?;
        ensure!(!self.exists(name), "file '{}' already exists", name);

        let storage = match self.file_path(name) {
            Some(path) => AnyStorage::Mmap(MmapStorage::create(&path, self.page_size)?),
            None => AnyStorage::Memory(MemoryStorage::new(self.page_size)),
        };

        Ok(self.table.write().register(name, storage))
    }

    /// Opens an existing file, returning the current id if it is already open.
    pub fn open_file(&self, name: &str) -> Result<FileId> {
        Self::validate_name(name)?;
        let mut table = self.table.write();

        if let Some(&id) = table.by_name.get(name) {
            return Ok(id);
        }

        let storage = match self.file_path(name) {
            Some(path) => {
                ensure!(path.exists(), "file '{}' does not exist", path.display());
                AnyStorage::Mmap(MmapStorage::open(&path, self.page_size)?)
            }
            None => match table.parked.remove(name) {
                Some(storage) => AnyStorage::Memory(storage),
                None => bail!("file '{}' does not exist", name),
            },
        };

        Ok(table.register(name, storage))
    }

    pub fn is_open(&self, id: FileId) -> bool {
        self.table.read().open.contains_key(&id)
    }

    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.table.read().by_name.get(name).copied()
    }

    pub fn file_name(&self, id: FileId) -> Result<String> {
        Ok(self.table.read().get(id)?.name.clone())
    }

    pub fn storage(&self, id: FileId) -> Result<Arc<RwLock<AnyStorage>>> {
        Ok(Arc::clone(&self.table.read().get(id)?.storage))
    }

    pub fn page_count(&self, id: FileId) -> Result<u32> {
        Ok(self.table.read().get(id)?.storage.read().page_count())
    }

    pub fn flush(&self, id: FileId) -> Result<()> {
        let storage = self.storage(id)?;
        let guard = storage.read();
        guard.sync()
    }

    pub fn close_file(&self, id: FileId, flush: bool) -> Result<()> {
        let mut table = self.table.write();
        let file = table
            .open
            .remove(&id)
            .ok_or_else(|| eyre::eyre!("file {:?} is not open", id))?;
        table.by_name.remove(&file.name);

        if flush {
            file.storage.read().sync()?;
        }

        match Arc::try_unwrap(file.storage) {
            Ok(lock) => {
                if let AnyStorage::Memory(storage) = lock.into_inner() {
                    table.parked.insert(file.name, storage);
                }
                Ok(())
            }
            Err(_) => bail!("file '{}' is still in use and cannot be closed", file.name),
        }
    }

    pub fn delete_file(&self, id: FileId) -> Result<()> {
        let mut table = self.table.write();
        let file = table
            .open
            .remove(&id)
            .ok_or_else(|| eyre::eyre!("file {:?} is not open", id))?;
        table.by_name.remove(&file.name);
        drop(file.storage);

        if let Some(path) = self.file_path(&file.name) {
            fs::remove_file(&path)
                .wrap_err_with(|| format!("failed to remove file '{}'", path.display()))?;
        }
        Ok(())
    }

    /// Renames an open file. The id stays valid.
    pub fn rename_file(&self, id: FileId, new_name: &str) -> Result<()> {
        Self::validate_name(new_name)?;
        ensure!(!self.exists(new_name), "file '{}' already exists", new_name);

        let mut table = self.table.write();
        let old_name = table.get(id)?.name.clone();

        if let (Some(old_path), Some(new_path)) =
            (self.file_path(&old_name), self.file_path(new_name))
        {
            fs::rename(&old_path, &new_path).wrap_err_with(|| {
                format!(
                    "failed to rename file from '{}' to '{}'",
                    old_path.display(),
                    new_path.display()
                )
            })?;
        }

        table.by_name.remove(&old_name);
        table.by_name.insert(new_name.to_string(), id);
        if let Some(file) = table.open.get_mut(&id) {
            file.name = new_name.to_string();
        }
        Ok(())
    }

    pub fn validate_name(name: &str) -> Result<()> {
        ensure!(!name.is_empty(), "name cannot be empty");
        ensure!(
            !name.contains('/') && !name.contains('\\'),
            "name cannot contain path separators"
        );
        ensure!(
            !name.contains(".."),
            "name cannot contain parent directory references"
        );
        ensure!(
            name.chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.'),
            "name can only contain alphanumeric characters, underscores, hyphens and dots"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE: usize = 1024;

    #[test]
    fn add_file_creates_empty_file_on_disk() {
        let dir = tempdir().unwrap();
        let files = FileManager::open(dir.path(), PAGE).unwrap();

        let id = files.add_file("users.pcl").unwrap();

        assert!(dir.path().join("users.pcl").exists());
        assert!(files.exists("users.pcl"));
        assert!(files.is_open(id));
        assert_eq!(files.page_count(id).unwrap(), 0);
        assert_eq!(files.file_name(id).unwrap(), "users.pcl");
    }

    #[test]
    fn add_file_rejects_duplicates_and_bad_names() {
        let files = FileManager::in_memory(PAGE);
        files.add_file("users.pcl").unwrap();

        assert!(files.add_file("users.pcl").is_err());
        assert!(files.add_file("../escape.pcl").is_err());
        assert!(files.add_file("a/b.pcl").is_err());
        assert!(files.add_file("").is_err());
    }

    #[test]
    fn open_file_returns_same_id_when_open() {
        let files = FileManager::in_memory(PAGE);
        let id = files.add_file("users.cpm").unwrap();

        assert_eq!(files.open_file("users.cpm").unwrap(), id);
        assert_eq!(files.file_id("users.cpm"), Some(id));
    }

    #[test]
    fn memory_file_survives_close_and_reopen() {
        let files = FileManager::in_memory(PAGE);
        let id = files.add_file("users.pcl").unwrap();
        {
            let storage = files.storage(id).unwrap();
            let mut guard = storage.write();
            guard.grow(2).unwrap();
            let mut page = vec![0u8; PAGE];
            page[0] = 9;
            guard.write_page(1, &page).unwrap();
        }

        files.close_file(id, true).unwrap();
        assert!(!files.is_open(id));
        assert!(files.exists("users.pcl"));

        let reopened = files.open_file("users.pcl").unwrap();
        assert_ne!(reopened, id);
        assert_eq!(files.page_count(reopened).unwrap(), 2);
        assert_eq!(
            files.storage(reopened).unwrap().read().page_direct(1).unwrap()[0],
            9
        );
    }

    #[test]
    fn mmap_file_survives_close_and_reopen() {
        let dir = tempdir().unwrap();
        let files = FileManager::open(dir.path(), PAGE).unwrap();
        let id = files.add_file("users.fsm").unwrap();
        files.storage(id).unwrap().write().grow(3).unwrap();
        files.close_file(id, true).unwrap();

        let files = FileManager::open(dir.path(), PAGE).unwrap();
        let id = files.open_file("users.fsm").unwrap();

        assert_eq!(files.page_count(id).unwrap(), 3);
    }

    #[test]
    fn close_fails_while_storage_is_borrowed() {
        let files = FileManager::in_memory(PAGE);
        let id = files.add_file("users.pcl").unwrap();
        let held = files.storage(id).unwrap();

        let result = files.close_file(id, false);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("still in use"));
        drop(held);
    }

    #[test]
    fn rename_keeps_id_and_moves_file() {
        let dir = tempdir().unwrap();
        let files = FileManager::open(dir.path(), PAGE).unwrap();
        let id = files.add_file("users.pcl").unwrap();
        files.add_file("taken.pcl").unwrap();

        assert!(files.rename_file(id, "taken.pcl").is_err());
        files.rename_file(id, "people.pcl").unwrap();

        assert_eq!(files.file_name(id).unwrap(), "people.pcl");
        assert_eq!(files.file_id("people.pcl"), Some(id));
        assert!(!files.exists("users.pcl"));
        assert!(dir.path().join("people.pcl").exists());
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempdir().unwrap();
        let files = FileManager::open(dir.path(), PAGE).unwrap();
        let id = files.add_file("users.pcl").unwrap();

        files.delete_file(id).unwrap();

        assert!(!files.exists("users.pcl"));
        assert!(!dir.path().join("users.pcl").exists());
        assert!(files.delete_file(id).is_err());
    }

    #[test]
    fn open_missing_file_fails() {
        let files = FileManager::in_memory(PAGE);
        assert!(files.open_file("nothing.pcl").is_err());
    }
}
