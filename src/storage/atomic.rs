//! # Atomic Operations
//!
//! An `AtomicOperation` groups every page mutation of one logical write so it
//! reaches the files all-or-nothing. Pages are copied into a private write set
//! on first modification; nothing touches the files until `commit()`.
//!
//! ## Write Set
//!
//! ```text
//! (FileId, page_no) -> Box<[u8]>   copied on first write_page / zeroed by add_page
//! FileId -> filled_up_to           page count including pages added by this operation
//! ```
//!
//! Reads consult the write set first, so an operation always sees its own
//! changes; other operations only see committed pages.
//!
//! ## File Lifecycle
//!
//! - `add_file` creates the (empty) file immediately; rollback deletes it.
//! - `delete_file` and `rename_file` are deferred until commit.
//!
//! ## Commit Order
//!
//! 1. Grow every file to its `filled_up_to`
//! 2. Write dirty pages in (file, page) order
//! 3. Apply deferred renames, then deletions
//!
//! ## Concurrency
//!
//! `AtomicOperationsManager::start()` hands out read-write operations one at
//! a time: each holds an owned guard on the manager's writer mutex until it
//! commits, rolls back or is dropped. Starting a second read-write operation
//! on the same thread while one is alive deadlocks. Read-only operations take
//! no guard and reject every mutation with `CollectionError::ReadOnlyOperation`.
//!
//! There is no write-ahead log: a crash during `commit()` can leave a
//! partially applied operation on disk.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::{HashMap, HashSet};
use parking_lot::{Mutex, RawMutex};
use tracing::{trace, warn};

use super::driver::StorageDriver;
use super::file_manager::{FileId, FileManager};
use crate::error::CollectionError;

type WriterGuard = parking_lot::lock_api::ArcMutexGuard<RawMutex, ()>;
type RollbackHook = Box<dyn FnOnce() + Send + Sync>;

pub struct AtomicOperation {
    files: Arc<FileManager>,
    operation_ts: u64,
    writer: Option<WriterGuard>,
    read_only: bool,
    pages: HashMap<(FileId, u32), Box<[u8]>>,
    filled_up_to: HashMap<FileId, u32>,
    created_files: Vec<FileId>,
    deleted_files: HashSet<FileId>,
    renamed_files: Vec<(FileId, String)>,
    rollback_hooks: Vec<RollbackHook>,
    completed: bool,
}

impl std::fmt::Debug for AtomicOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicOperation")
            .field("operation_ts", &self.operation_ts)
            .field("read_only", &self.read_only)
            .field("dirty_pages", &self.pages.len())
            .finish()
    }
}

impl AtomicOperation {
    fn new(files: Arc<FileManager>, operation_ts: u64, writer: Option<WriterGuard>) -> Self {
        let read_only = writer.is_none();
        Self {
            files,
            operation_ts,
            writer,
            read_only,
            pages: HashMap::new(),
            filled_up_to: HashMap::new(),
            created_files: Vec::new(),
            deleted_files: HashSet::new(),
            renamed_files: Vec::new(),
            rollback_hooks: Vec::new(),
            completed: false,
        }
    }

    pub fn operation_ts(&self) -> u64 {
        self.operation_ts
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn files(&self) -> &Arc<FileManager> {
        &self.files
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            bail!(CollectionError::ReadOnlyOperation);
        }
        Ok(())
    }

    fn ensure_live(&self, file: FileId) -> Result<()> {
        ensure!(
            !self.deleted_files.contains(&file),
            "file {:?} is deleted in this atomic operation",
            file
        );
        Ok(())
    }

    /// Number of pages of `file` as seen by this operation.
    pub fn filled_up_to(&self, file: FileId) -> Result<u32> {
        self.ensure_live(file)?;
        match self.filled_up_to.get(&file) {
            Some(&count) => Ok(count),
            None => self.files.page_count(file),
        }
    }

    pub fn read_page<R>(
        &self,
        file: FileId,
        page_no: u32,
        f: impl FnOnce(&[u8]) -> Result<R>,
    ) -> Result<R> {
        if let Some(buf) = self.pages.get(&(file, page_no)) {
            return f(buf);
        }

        let count = self.filled_up_to(file)?;
        ensure!(
            page_no < count,
            "page {} of file {:?} is beyond end of file ({} pages)",
            page_no,
            file,
            count
        );

        let storage = self.files.storage(file)?;
        let guard = storage.read();
        f(guard.page_direct(page_no)?)
    }

    pub fn write_page<R>(
        &mut self,
        file: FileId,
        page_no: u32,
        f: impl FnOnce(&mut [u8]) -> Result<R>,
    ) -> Result<R> {
        self.ensure_writable()?;

        if !self.pages.contains_key(&(file, page_no)) {
            let count = self.filled_up_to(file)?;
            ensure!(
                page_no < count,
                "page {} of file {:?} is beyond end of file ({} pages)",
                page_no,
                file,
                count
            );

            let storage = self.files.storage(file)?;
            let copy: Box<[u8]> = storage.read().page_direct(page_no)?.into();
            self.pages.insert((file, page_no), copy);
        }

        match self.pages.get_mut(&(file, page_no)) {
            Some(buf) => f(buf),
            None => bail!("page {} of file {:?} vanished from write set", page_no, file),
        }
    }

    /// Appends a zeroed page to `file` and returns its index.
    pub fn add_page(&mut self, file: FileId) -> Result<u32> {
        self.ensure_writable()?;
        let page_no = self.filled_up_to(file)?;
        let page_size = self.files.page_size();

        self.pages
            .insert((file, page_no), vec![0u8; page_size].into_boxed_slice());
        self.filled_up_to.insert(file, page_no + 1);
        Ok(page_no)
    }

    pub fn file_exists(&self, name: &str) -> bool {
        match self.files.file_id(name) {
            Some(id) if self.deleted_files.contains(&id) => false,
            _ => self.files.exists(name),
        }
    }

    pub fn add_file(&mut self, name: &str) -> Result<FileId> {
        self.ensure_writable()?;
        let id = self.files.add_file(name)?;
        self.created_files.push(id);
        Ok(id)
    }

    pub fn open_file(&self, name: &str) -> Result<FileId> {
        self.files.open_file(name)
    }

    pub fn delete_file(&mut self, file: FileId) -> Result<()> {
        self.ensure_writable()?;
        self.ensure_live(file)?;
        self.pages.retain(|(f, _), _| *f != file);
        self.filled_up_to.remove(&file);
        self.deleted_files.insert(file);
        Ok(())
    }

    pub fn rename_file(&mut self, file: FileId, new_name: &str) -> Result<()> {
        self.ensure_writable()?;
        self.ensure_live(file)?;
        FileManager::validate_name(new_name)?;
        self.renamed_files.push((file, new_name.to_string()));
        Ok(())
    }

    /// Registers `hook` to run if this operation rolls back. Hooks run in
    /// reverse registration order after created files are removed; a commit
    /// drops them unrun.
    pub fn on_rollback(&mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Result<()> {
        self.ensure_writable()?;
        self.rollback_hooks.push(Box::new(hook));
        Ok(())
    }

    /// Hints the storage of `file` to load `count` pages from `start_page`.
    pub fn prefetch(&self, file: FileId, start_page: u32, count: u32) -> Result<()> {
        self.files.storage(file)?.read().prefetch(start_page, count);
        Ok(())
    }

    pub fn commit(mut self) -> Result<()> {
        self.completed = true;
        self.rollback_hooks.clear();
        if self.read_only {
            return Ok(());
        }

        let pending_sizes: Vec<(FileId, u32)> =
            self.filled_up_to.iter().map(|(&f, &n)| (f, n)).collect();
        for (file, count) in pending_sizes {
            if self.deleted_files.contains(&file) {
                continue;
            }
            self.files.storage(file)?.write().grow(count)?;
        }

        let mut keys: Vec<(FileId, u32)> = self.pages.keys().copied().collect();
        keys.sort_unstable();
        let page_count = keys.len();

        for (file, page_no) in keys {
            let storage = self.files.storage(file)?;
            if let Some(buf) = self.pages.get(&(file, page_no)) {
                storage.write().write_page(page_no, buf)?;
            }
        }

        for (file, new_name) in std::mem::take(&mut self.renamed_files) {
            if !self.deleted_files.contains(&file) {
                self.files.rename_file(file, &new_name)?;
            }
        }

        for file in std::mem::take(&mut self.deleted_files) {
            self.files.delete_file(file)?;
        }

        trace!(
            operation_ts = self.operation_ts,
            pages = page_count,
            "atomic operation committed"
        );
        self.writer.take();
        Ok(())
    }

    pub fn rollback(mut self) -> Result<()> {
        self.completed = true;
        self.discard()
    }

    fn discard(&mut self) -> Result<()> {
        if !self.pages.is_empty() || !self.created_files.is_empty() {
            warn!(
                operation_ts = self.operation_ts,
                pages = self.pages.len(),
                created_files = self.created_files.len(),
                "rolling back atomic operation"
            );
        }

        self.pages.clear();
        self.filled_up_to.clear();
        self.renamed_files.clear();
        self.deleted_files.clear();

        let mut result = Ok(());
        for file in std::mem::take(&mut self.created_files) {
            if let Err(e) = self.files.delete_file(file) {
                result = Err(e);
            }
        }
        while let Some(hook) = self.rollback_hooks.pop() {
            hook();
        }
        self.writer.take();
        result
    }
}

impl Drop for AtomicOperation {
    fn drop(&mut self) {
        if !self.completed {
            if let Err(e) = self.discard() {
                warn!(error = %e, "failed to discard abandoned atomic operation");
            }
        }
    }
}

/// Hands out atomic operations over one `FileManager` and serializes the
/// read-write ones.
#[derive(Debug)]
pub struct AtomicOperationsManager {
    files: Arc<FileManager>,
    writer: Arc<Mutex<()>>,
    next_ts: AtomicU64,
}

impl AtomicOperationsManager {
    pub fn new(files: Arc<FileManager>) -> Self {
        Self {
            files,
            writer: Arc::new(Mutex::new(())),
            next_ts: AtomicU64::new(1),
        }
    }

    pub fn files(&self) -> &Arc<FileManager> {
        &self.files
    }

    fn next_ts(&self) -> u64 {
        self.next_ts.fetch_add(1, Ordering::Relaxed)
    }

    pub fn start(&self) -> AtomicOperation {
        let guard = self.writer.lock_arc();
        AtomicOperation::new(Arc::clone(&self.files), self.next_ts(), Some(guard))
    }

    pub fn start_read_only(&self) -> AtomicOperation {
        AtomicOperation::new(Arc::clone(&self.files), self.next_ts(), None)
    }

    /// Runs `f` inside a read-write operation, committing on `Ok` and rolling
    /// back on `Err`.
    pub fn execute<T>(&self, f: impl FnOnce(&mut AtomicOperation) -> Result<T>) -> Result<T> {
        let mut op = self.start();
        match f(&mut op) {
            Ok(value) => {
                op.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = op.rollback() {
                    warn!(error = %rollback_err, "rollback after failure did not complete");
                }
                Err(e)
            }
        }
    }

    pub fn read<T>(&self, f: impl FnOnce(&AtomicOperation) -> Result<T>) -> Result<T> {
        let op = self.start_read_only();
        let value = f(&op)?;
        op.commit()?;
        Ok(value)
    }
}
