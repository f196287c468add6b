//! # Collection
//!
//! A collection stores variable-length records addressed by stable logical
//! positions. It owns three files and keeps them consistent inside the
//! caller's atomic operation:
//!
//! ```text
//! <name>.pcl   page 0: StatePage, pages 1..: data pages holding chunks
//! <name>.cpm   PositionMap: position -> entry-point chunk (page, slot, version)
//! <name>.fsm   FreeSpaceMap: data page -> normalized free space
//! ```
//!
//! ## Write Path
//!
//! ```text
//! create_record(content)
//!   1. position     = given pre-allocated one, or PositionMap::allocate
//!   2. serialize    tail chunk first; each chunk goes to a page from the
//!                   supplier, each touched page is pushed to the FSM
//!   3. state page   record_count += 1, total_content_bytes += len
//!   4. publish      PositionMap::update(position, entry point)
//! ```
//!
//! The supplier is the only thing that differs between create and update.
//! Create asks the FSM (falling back to a fresh page). Update first hands
//! out the pages freed by deleting the old chain, last freed first, and only
//! then falls back to the FSM, so a same-size update lands on the same
//! `(page, slot)`.
//!
//! ## Page Search Policy
//!
//! ```text
//! bytes = min(remaining, MAX_ENTRY_SIZE)
//! bytes >= page_size - INTERVAL         -> find(chunk_size(bytes / 2) / 2)
//! otherwise find(chunk_size(bytes)), and when that fails and
//! bytes > MAX_ENTRY_SIZE / 2            -> find(chunk_size(bytes / 2) / 2)
//! nothing found, or the page is too full -> allocate a new data page
//! ```
//!
//! The half-size retry accepts a worse split of an oversized record instead
//! of growing the file for every chunk.
//!
//! ## Read Path
//!
//! The entry-point chunk is read first and its payloads are concatenated in
//! chain order. A missing or unflagged head is `RecordNotFound`; anything
//! that breaks later (missing chunk, loop, bad header, position or version
//! mismatch) is `Corrupted`.
//!
//! ## Locking
//!
//! Collection state sits behind a `parking_lot::RwLock`. Readers share it,
//! everything that writes pages or files takes it exclusively. Page-level
//! isolation comes from the atomic operation itself.
//!
//! Create, open, delete and rename change the in-memory file state before
//! the operation commits. Each registers a rollback hook that puts the
//! previous names and file ids back if the operation is discarded.

use std::sync::Arc;

use eyre::{bail, ensure, eyre, Result, WrapErr};
use hashbrown::HashSet;
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{debug, info, trace};

use super::bucket::{PositionEntry, PositionStatus};
use super::chunk::{
    chunk_pointer, chunk_size, entry_size, serialize_entry_chunk, Chunk, RecordMetadata,
    TAIL_POINTER,
};
use super::component::ComponentFile;
use super::data_page::{DataPage, DataPageMut};
use super::free_space_map::FreeSpaceMap;
use super::position_map::{PositionMap, PositionMapEntry};
use super::state::StatePage;
use super::types::{BrowseEntry, BrowsePage, PhysicalPosition, RawRecord, RecordStatus};
use crate::config::{
    max_entry_size_for, normalization_interval_for, CollectionConfig, RecordConflictStrategy,
    DATA_FILE_EXTENSION, FSM_REBUILD_PROGRESS_INTERVAL, METADATA_SIZE, MIN_ENTRY_SIZE,
};
use crate::error::CollectionError;
use crate::storage::{AtomicOperation, FileManager};

const STATE_PAGE: u32 = 0;

/// Page and slot of each freed chunk, in chain order.
type PageList = SmallVec<[(u32, u16); 4]>;

/// Smallest page room that lets a chunk carry at least one entry byte while
/// `remaining` bytes are left. The metadata header goes in one piece, so the
/// last chunk needs room for all of it.
fn min_chunk_room(remaining: usize) -> usize {
    if remaining <= METADATA_SIZE {
        METADATA_SIZE + MIN_ENTRY_SIZE
    } else {
        MIN_ENTRY_SIZE + 1
    }
}

fn validate_collection_name(name: &str) -> Result<()> {
    if FileManager::validate_name(name).is_err() {
        bail!(CollectionError::InvalidCollectionName {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn check_content_size(content: &[u8]) -> Result<()> {
    if content.len() > i32::MAX as usize {
        bail!(CollectionError::RecordTooLarge {
            size: content.len(),
        });
    }
    Ok(())
}

/// Outcome of one serialization pass.
struct SerializedChain {
    head: Option<(u32, u16)>,
    remaining: usize,
}

struct DeletedChain {
    pages: PageList,
    content_length: usize,
}

enum ChunkRead {
    Next(Option<(u32, u16)>),
    Missing,
    NotEntryPoint,
    Truncated,
    VersionMismatch(Option<u64>),
}

#[derive(Debug)]
pub struct Collection {
    files: Arc<FileManager>,
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Clone)]
struct Inner {
    config: CollectionConfig,
    data: ComponentFile,
    position_map: PositionMap,
    free_space_map: FreeSpaceMap,
}

impl Collection {
    pub fn new(config: CollectionConfig, files: Arc<FileManager>) -> Result<Self> {
        config.validate()?;
        ensure!(
            config.get_page_size() == files.page_size(),
            "collection page size {} differs from file manager page size {}",
            config.get_page_size(),
            files.page_size()
        );
        validate_collection_name(config.get_name())?;

        Ok(Self {
            files,
            inner: Arc::new(RwLock::new(Inner::new(config))),
        })
    }

    /// Sets id and name of a collection whose files are not open yet.
    pub fn configure(&self, id: u32, name: &str) -> Result<()> {
        validate_collection_name(name)?;
        let mut inner = self.inner.write();
        ensure!(
            !inner.data.is_open(),
            "collection '{}' is open and cannot be reconfigured",
            inner.config.get_name()
        );

        let mut config = inner.config.clone();
        config.set_id(id);
        config.set_name(name.to_string());
        *inner = Inner::new(config);
        Ok(())
    }

    pub fn create(&self, op: &mut AtomicOperation) -> Result<()> {
        let mut guard = self.inner.write();
        self.restore_on_rollback(op, &guard)?;
        let inner = &mut *guard;

        let file = inner.data.create(op)?;
        let state = op.add_page(file)?;
        ensure!(
            state == STATE_PAGE,
            "new data file '{}' did not start at page 0",
            inner.data.full_name()
        );
        op.write_page(file, state, |buf| {
            StatePage::init(buf)?;
            Ok(())
        })?;

        inner.position_map.create(op)?;
        inner.free_space_map.create(op)?;

        debug!(
            collection = inner.config.get_name(),
            id = inner.config.get_id(),
            page_size = inner.config.get_page_size(),
            "created collection"
        );
        Ok(())
    }

    /// Opens all three files. A missing free-space map is created and
    /// rebuilt from the data pages.
    pub fn open(&self, op: &mut AtomicOperation) -> Result<()> {
        let mut guard = self.inner.write();
        self.restore_on_rollback(op, &guard)?;
        let inner = &mut *guard;

        inner.data.open(op)?;
        inner.position_map.open(op)?;

        if inner.free_space_map.exists(op) {
            inner.free_space_map.open(op)?;
        } else {
            inner.free_space_map.create(op)?;
            inner.rebuild_free_space_map(op)?;
        }

        debug!(
            collection = inner.config.get_name(),
            id = inner.config.get_id(),
            "opened collection"
        );
        Ok(())
    }

    pub fn close(&self, flush: bool) -> Result<()> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.data.close(&self.files, flush)?;
        inner.position_map.close(&self.files, flush)?;
        inner.free_space_map.close(&self.files, flush)?;
        Ok(())
    }

    /// Deletes the files of an open collection. Takes effect on commit.
    pub fn delete(&self, op: &mut AtomicOperation) -> Result<()> {
        let mut guard = self.inner.write();
        self.restore_on_rollback(op, &guard)?;
        let inner = &mut *guard;
        inner.data.delete(op)?;
        inner.position_map.delete(op)?;
        inner.free_space_map.delete(op)?;
        debug!(collection = inner.config.get_name(), "deleted collection");
        Ok(())
    }

    pub fn exists(&self, op: &AtomicOperation) -> bool {
        self.inner.read().data.exists(op)
    }

    pub fn allocate_position(
        &self,
        op: &mut AtomicOperation,
        record_type: u8,
    ) -> Result<PhysicalPosition> {
        let inner = self.inner.write();
        Ok(PhysicalPosition {
            position: inner.position_map.allocate(op)?,
            record_type,
            version: None,
        })
    }

    pub fn create_record(
        &self,
        op: &mut AtomicOperation,
        content: &[u8],
        version: u64,
        record_type: u8,
        allocated: Option<u64>,
    ) -> Result<PhysicalPosition> {
        self.inner
            .write()
            .create_record(op, content, version, record_type, allocated)
    }

    pub fn read_record(&self, op: &AtomicOperation, position: u64) -> Result<RawRecord> {
        self.inner.read().read_record(op, position)
    }

    pub fn update_record(
        &self,
        op: &mut AtomicOperation,
        position: u64,
        content: &[u8],
        version: u64,
        record_type: u8,
    ) -> Result<()> {
        self.inner
            .write()
            .update_record(op, position, content, version, record_type)
    }

    pub fn update_record_version(
        &self,
        op: &mut AtomicOperation,
        position: u64,
        version: u64,
    ) -> Result<()> {
        self.inner.write().update_record_version(op, position, version)
    }

    /// Deletes the record and tombstones its position. `false` when there
    /// was nothing to delete.
    pub fn delete_record(&self, op: &mut AtomicOperation, position: u64) -> Result<bool> {
        self.inner.write().delete_record(op, position)
    }

    pub fn record_exists(&self, op: &AtomicOperation, position: u64) -> Result<bool> {
        self.inner.read().record_exists(op, position)
    }

    pub fn get_physical_position(
        &self,
        op: &AtomicOperation,
        position: u64,
    ) -> Result<Option<PhysicalPosition>> {
        self.inner.read().get_physical_position(op, position)
    }

    /// Page and slot of the record's entry-point chunk.
    pub fn record_coordinates(
        &self,
        op: &AtomicOperation,
        position: u64,
    ) -> Result<Option<PositionEntry>> {
        self.inner.read().position_map.get_filled(op, position)
    }

    pub fn get_record_status(&self, op: &AtomicOperation, position: u64) -> Result<RecordStatus> {
        let status = self.inner.read().position_map.get_status(op, position)?;
        Ok(match status {
            PositionStatus::NotExistent => RecordStatus::NotExistent,
            PositionStatus::Allocated => RecordStatus::Allocated,
            PositionStatus::Filled => RecordStatus::Present,
            PositionStatus::Removed => RecordStatus::Removed,
        })
    }

    pub fn higher_positions(
        &self,
        op: &AtomicOperation,
        position: u64,
        limit: usize,
    ) -> Result<Vec<u64>> {
        self.inner.read().position_map.higher(op, position, limit)
    }

    pub fn ceiling_positions(
        &self,
        op: &AtomicOperation,
        position: u64,
        limit: usize,
    ) -> Result<Vec<u64>> {
        self.inner.read().position_map.ceiling(op, position, limit)
    }

    pub fn lower_positions(
        &self,
        op: &AtomicOperation,
        position: u64,
        limit: usize,
    ) -> Result<Vec<u64>> {
        self.inner.read().position_map.lower(op, position, limit)
    }

    pub fn floor_positions(
        &self,
        op: &AtomicOperation,
        position: u64,
        limit: usize,
    ) -> Result<Vec<u64>> {
        self.inner.read().position_map.floor(op, position, limit)
    }

    /// Visits every Filled and Removed position with its status and version.
    pub fn for_each_entry(
        &self,
        op: &AtomicOperation,
        visit: impl FnMut(u64, PositionStatus, u64) -> Result<()>,
    ) -> Result<()> {
        self.inner.read().position_map.for_each_entry(op, visit)
    }

    pub fn first_position(&self, op: &AtomicOperation) -> Result<Option<u64>> {
        self.inner.read().position_map.first_position(op)
    }

    pub fn last_position(&self, op: &AtomicOperation) -> Result<Option<u64>> {
        self.inner.read().position_map.last_position(op)
    }

    /// Reads the next batch of records after (`forward`) or before `cursor`.
    /// `None` as cursor starts at the respective end of the collection.
    pub fn next_page(
        &self,
        op: &AtomicOperation,
        cursor: Option<u64>,
        forward: bool,
    ) -> Result<Option<BrowsePage>> {
        self.inner.read().next_page(op, cursor, forward)
    }

    pub fn get_entries(&self, op: &AtomicOperation) -> Result<u64> {
        self.inner.read().read_state(op, |state| state.record_count())
    }

    pub fn get_records_size(&self, op: &AtomicOperation) -> Result<u64> {
        self.inner
            .read()
            .read_state(op, |state| state.total_content_bytes())
    }

    pub fn synch(&self) -> Result<()> {
        let inner = self.inner.read();
        inner.data.flush(&self.files)?;
        inner.position_map.flush(&self.files)?;
        inner.free_space_map.flush(&self.files)
    }

    /// Renames the three backing files. The new names take effect on commit.
    pub fn set_collection_name(&self, op: &mut AtomicOperation, new_name: &str) -> Result<()> {
        validate_collection_name(new_name)?;
        let mut guard = self.inner.write();
        self.restore_on_rollback(op, &guard)?;
        let inner = &mut *guard;

        inner.data.rename(op, new_name)?;
        inner.position_map.rename(op, new_name)?;
        inner.free_space_map.rename(op, new_name)?;

        debug!(
            from = inner.config.get_name(),
            to = new_name,
            "renamed collection"
        );
        inner.config.set_name(new_name.to_string());
        Ok(())
    }

    /// Puts the current names and file ids back if `op` rolls back.
    fn restore_on_rollback(&self, op: &mut AtomicOperation, current: &Inner) -> Result<()> {
        let before = current.clone();
        let inner = Arc::clone(&self.inner);
        op.on_rollback(move || inner.write().restore_files(before))
    }

    pub fn set_record_conflict_strategy(&self, name: &str) -> Result<()> {
        let strategy: RecordConflictStrategy = name.parse()?;
        self.inner.write().config.set_conflict_strategy(strategy);
        Ok(())
    }

    pub fn record_conflict_strategy(&self) -> RecordConflictStrategy {
        self.inner.read().config.get_conflict_strategy()
    }

    pub fn id(&self) -> u32 {
        self.inner.read().config.get_id()
    }

    pub fn name(&self) -> String {
        self.inner.read().config.get_name().to_string()
    }

    /// Name of the data file, `<name>.pcl`.
    pub fn file_name(&self) -> String {
        self.inner.read().data.full_name()
    }

    pub fn config(&self) -> CollectionConfig {
        self.inner.read().config.clone()
    }

    /// Persistable description of the collection.
    pub fn generate_collection_config(&self) -> CollectionConfig {
        let inner = self.inner.read();
        CollectionConfig::new(inner.config.get_id(), inner.config.get_name())
            .page_size(inner.config.get_page_size())
            .conflict_strategy(inner.config.get_conflict_strategy())
    }
}

impl Inner {
    fn new(config: CollectionConfig) -> Self {
        let name = config.get_name().to_string();
        let page_size = config.get_page_size();
        Self {
            data: ComponentFile::new(&name, DATA_FILE_EXTENSION),
            position_map: PositionMap::new(&name, page_size),
            free_space_map: FreeSpaceMap::new(&name, page_size),
            config,
        }
    }

    /// Takes the file state of `before`, keeping the conflict strategy and
    /// id set since.
    fn restore_files(&mut self, before: Inner) {
        self.config.set_name(before.config.get_name().to_string());
        self.data = before.data;
        self.position_map = before.position_map;
        self.free_space_map = before.free_space_map;
    }

    fn not_found(&self, position: u64) -> CollectionError {
        CollectionError::RecordNotFound {
            collection: self.config.get_id(),
            position,
        }
    }

    fn corrupted(&self, position: u64, reason: impl Into<String>) -> CollectionError {
        CollectionError::Corrupted {
            collection: self.config.get_id(),
            position,
            reason: reason.into(),
        }
    }

    fn read_state<R>(&self, op: &AtomicOperation, f: impl FnOnce(&StatePage) -> R) -> Result<R> {
        op.read_page(self.data.id()?, STATE_PAGE, |buf| {
            Ok(f(StatePage::from_bytes(buf)?))
        })
    }

    fn update_state(&self, op: &mut AtomicOperation, f: impl FnOnce(&mut StatePage)) -> Result<()> {
        op.write_page(self.data.id()?, STATE_PAGE, |buf| {
            f(StatePage::from_bytes_mut(buf)?);
            Ok(())
        })
    }

    /// Whether `page_index` can hold chunks: not the state page and inside
    /// the data file.
    fn is_data_page(&self, op: &AtomicOperation, page_index: u32) -> Result<bool> {
        Ok(page_index != STATE_PAGE && page_index < op.filled_up_to(self.data.id()?)?)
    }

    fn rebuild_free_space_map(&self, op: &mut AtomicOperation) -> Result<()> {
        let file = self.data.id()?;
        let in_use = self.read_state(op, |state| state.file_size())?;
        let pages = u32::try_from(in_use)
            .wrap_err_with(|| format!("data file of {} pages exceeds page index range", in_use))?;

        info!(
            collection = self.config.get_name(),
            pages, "rebuilding free space map"
        );

        for page_index in 1..=pages {
            if (page_index - 1) % FSM_REBUILD_PROGRESS_INTERVAL == 0 {
                op.prefetch(file, page_index, FSM_REBUILD_PROGRESS_INTERVAL)?;
            }
            let free = op.read_page(file, page_index, |buf| {
                Ok(DataPage::from_page(buf)?.max_record_size())
            })?;
            self.free_space_map
                .update_page_free_space(op, page_index, free)?;

            if page_index % FSM_REBUILD_PROGRESS_INTERVAL == 0 {
                info!(
                    collection = self.config.get_name(),
                    processed = page_index,
                    pages,
                    "free space map rebuild in progress"
                );
            }
        }

        info!(
            collection = self.config.get_name(),
            pages, "free space map rebuilt"
        );
        Ok(())
    }

    fn find_free_page_for(&self, op: &AtomicOperation, bytes: usize) -> Result<Option<u32>> {
        let page_size = self.config.get_page_size();
        let max_entry = max_entry_size_for(page_size);
        let bytes = bytes.min(max_entry);
        let half_chunk = chunk_size(bytes / 2) / 2;

        if bytes >= page_size - normalization_interval_for(page_size) {
            return self.free_space_map.find_free_page(op, half_chunk);
        }

        if let Some(page) = self.free_space_map.find_free_page(op, chunk_size(bytes))? {
            return Ok(Some(page));
        }
        if bytes > max_entry / 2 {
            return self.free_space_map.find_free_page(op, half_chunk);
        }
        Ok(None)
    }

    fn find_new_page(&self, op: &mut AtomicOperation, bytes: usize) -> Result<u32> {
        if let Some(page_index) = self.find_free_page_for(op, bytes)? {
            if self.is_data_page(op, page_index)? {
                let room = op.read_page(self.data.id()?, page_index, |buf| {
                    Ok(DataPage::from_page(buf)?.max_record_size())
                })?;
                if room >= min_chunk_room(bytes) {
                    return Ok(page_index);
                }
            }
        }
        self.allocate_new_page(op)
    }

    fn allocate_new_page(&self, op: &mut AtomicOperation) -> Result<u32> {
        let file = self.data.id()?;
        let in_use = self.read_state(op, |state| state.file_size())?;
        let filled = op.filled_up_to(file)? as u64;
        let next = in_use + 1;

        let page_index = if next >= filled {
            op.add_page(file)?
        } else {
            u32::try_from(next)
                .wrap_err_with(|| format!("data page {} exceeds page index range", next))?
        };
        ensure!(
            page_index as u64 == next,
            "data file '{}' out of sync: page {} in use count {}",
            self.data.full_name(),
            page_index,
            in_use
        );

        op.write_page(file, page_index, |buf| {
            DataPageMut::init(buf)?;
            Ok(())
        })?;
        self.update_state(op, |state| state.set_file_size(next))?;

        debug!(
            collection = self.config.get_name(),
            page_index, "allocated data page"
        );
        Ok(page_index)
    }

    /// Writes the last `remaining` entry bytes as a chunk chain ending in
    /// `next_pointer`, taking pages from `next_page` until it runs dry. A
    /// page may come with the slot its chunk should go back to.
    #[allow(clippy::too_many_arguments)]
    fn serialize_record(
        &self,
        op: &mut AtomicOperation,
        content: &[u8],
        metadata: &RecordMetadata,
        mut remaining: usize,
        mut next_pointer: i64,
        version: u64,
        mut next_page: impl FnMut(&mut AtomicOperation, usize) -> Result<Option<(u32, Option<u16>)>>,
    ) -> Result<SerializedChain> {
        let file = self.data.id()?;
        let mut head = None;

        while remaining > 0 {
            let Some((page_index, preferred)) = next_page(op, remaining.max(MIN_ENTRY_SIZE + 1))?
            else {
                break;
            };
            let needed = min_chunk_room(remaining);

            let written = op.write_page(file, page_index, |buf| {
                let mut page = DataPageMut::from_page(buf)?;
                let available = page.max_record_size();
                if available < needed {
                    return Ok(None);
                }

                let size = available.min(chunk_size(remaining));
                let (chunk, written) =
                    serialize_entry_chunk(content, size, remaining, next_pointer, metadata);
                let slot = page.append_record_at(version, &chunk, preferred)?.ok_or_else(|| {
                    eyre!(
                        "data page {} rejected chunk of {} bytes ({} available)",
                        page_index,
                        chunk.len(),
                        available
                    )
                })?;
                Ok(Some((slot, written, chunk.len(), page.max_record_size())))
            })?;

            let Some((slot, written, chunk_len, free)) = written else {
                continue;
            };
            self.free_space_map
                .update_page_free_space(op, page_index, free)?;

            remaining -= written;
            trace!(
                collection = self.config.get_name(),
                position = metadata.position,
                page_index,
                slot,
                chunk_len,
                remaining,
                "wrote record chunk"
            );

            next_pointer = chunk_pointer(page_index, slot);
            head = Some((page_index, slot));
        }

        Ok(SerializedChain { head, remaining })
    }

    fn create_record(
        &self,
        op: &mut AtomicOperation,
        content: &[u8],
        version: u64,
        record_type: u8,
        allocated: Option<u64>,
    ) -> Result<PhysicalPosition> {
        check_content_size(content)?;

        let position = match allocated {
            Some(position) => {
                let status = self.position_map.get_status(op, position)?;
                ensure!(
                    status == PositionStatus::Allocated,
                    "position {} is {:?}, not allocated",
                    position,
                    status
                );
                position
            }
            None => self.position_map.allocate(op)?,
        };

        let metadata = RecordMetadata {
            record_type,
            content_length: content.len(),
            position,
        };
        let chain = self.serialize_record(
            op,
            content,
            &metadata,
            entry_size(content.len()),
            TAIL_POINTER,
            version,
            |op, bytes| Ok(Some((self.find_new_page(op, bytes)?, None))),
        )?;
        let (page_index, slot) = self.finished_head(position, chain)?;

        let added = content.len() as u64;
        self.update_state(op, |state| {
            state.set_record_count(state.record_count() + 1);
            state.set_total_content_bytes(state.total_content_bytes() + added);
        })?;

        self.position_map.update(
            op,
            position,
            PositionEntry {
                page_index,
                slot,
                version,
            },
        )?;

        Ok(PhysicalPosition {
            position,
            record_type,
            version: Some(version),
        })
    }

    fn finished_head(&self, position: u64, chain: SerializedChain) -> Result<(u32, u16)> {
        ensure!(
            chain.remaining == 0,
            "record {} left {} bytes unwritten",
            position,
            chain.remaining
        );
        chain
            .head
            .ok_or_else(|| eyre!("record {} produced no chunks", position))
    }

    fn read_record(&self, op: &AtomicOperation, position: u64) -> Result<RawRecord> {
        let entry = self
            .position_map
            .get_filled(op, position)?
            .ok_or_else(|| self.not_found(position))?;
        self.read_chain(op, position, entry)
    }

    fn read_chain(
        &self,
        op: &AtomicOperation,
        position: u64,
        entry: PositionEntry,
    ) -> Result<RawRecord> {
        let file = self.data.id()?;
        let mut assembled = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some((entry.page_index, entry.slot));

        while let Some((page_index, slot)) = current {
            let first = visited.is_empty();
            if !visited.insert((page_index, slot)) {
                bail!(self.corrupted(
                    position,
                    format!("chunk chain loops back to page {} slot {}", page_index, slot)
                ));
            }

            let step = if self.is_data_page(op, page_index)? {
                op.read_page(file, page_index, |buf| {
                    let page = DataPage::from_page(buf)?;
                    let Some(bytes) = page.record(slot as usize) else {
                        return Ok(ChunkRead::Missing);
                    };
                    let Ok(chunk) = Chunk::new(bytes) else {
                        return Ok(ChunkRead::Truncated);
                    };
                    if first {
                        if !chunk.is_entry_point() {
                            return Ok(ChunkRead::NotEntryPoint);
                        }
                        let stored = page.record_version(slot as usize);
                        if stored != Some(entry.version) {
                            return Ok(ChunkRead::VersionMismatch(stored));
                        }
                    }
                    assembled.extend_from_slice(chunk.payload());
                    Ok(ChunkRead::Next(chunk.next()))
                })?
            } else {
                ChunkRead::Missing
            };

            current = match step {
                ChunkRead::Next(next) => next,
                ChunkRead::NotEntryPoint => bail!(self.not_found(position)),
                ChunkRead::Missing if first => bail!(self.not_found(position)),
                ChunkRead::Missing => bail!(self.corrupted(
                    position,
                    format!("chunk at page {} slot {} is missing", page_index, slot)
                )),
                ChunkRead::Truncated => bail!(self.corrupted(
                    position,
                    format!("chunk at page {} slot {} is truncated", page_index, slot)
                )),
                ChunkRead::VersionMismatch(stored) => bail!(self.corrupted(
                    position,
                    format!(
                        "entry point version {:?} differs from indexed version {}",
                        stored, entry.version
                    )
                )),
            };
        }

        let metadata = RecordMetadata::decode(&assembled)
            .map_err(|e| self.corrupted(position, e.to_string()))?;
        if metadata.position != position {
            bail!(self.corrupted(
                position,
                format!("embedded position {} does not match", metadata.position)
            ));
        }

        let end = METADATA_SIZE + metadata.content_length;
        if end > assembled.len() {
            bail!(self.corrupted(
                position,
                format!(
                    "content length {} exceeds {} assembled bytes",
                    metadata.content_length,
                    assembled.len() - METADATA_SIZE
                )
            ));
        }

        Ok(RawRecord {
            content: assembled[METADATA_SIZE..end].to_vec(),
            version: entry.version,
            record_type: metadata.record_type,
        })
    }

    /// Deletes every chunk of the chain starting at `entry` and pushes the
    /// new free space of each page to the FSM. `None` when the head chunk is
    /// already gone. Pages are returned in chain order.
    fn delete_chain(
        &self,
        op: &mut AtomicOperation,
        position: u64,
        entry: PositionEntry,
    ) -> Result<Option<DeletedChain>> {
        let file = self.data.id()?;
        let mut pages = PageList::new();
        let mut visited = HashSet::new();
        let mut content_length = 0;
        let mut current = Some((entry.page_index, entry.slot));

        while let Some((page_index, slot)) = current {
            let first = pages.is_empty();
            if !visited.insert((page_index, slot)) {
                bail!(self.corrupted(
                    position,
                    format!("chunk chain loops back to page {} slot {}", page_index, slot)
                ));
            }

            let removed = if self.is_data_page(op, page_index)? {
                op.write_page(file, page_index, |buf| {
                    let mut page = DataPageMut::from_page(buf)?;
                    let chunk = page.delete_record(slot as usize)?;
                    Ok(chunk.map(|bytes| (bytes, page.max_record_size())))
                })?
            } else {
                None
            };

            let Some((bytes, free)) = removed else {
                if first {
                    return Ok(None);
                }
                bail!(self.corrupted(
                    position,
                    format!("chunk at page {} slot {} is missing", page_index, slot)
                ));
            };

            let chunk = Chunk::new(&bytes).map_err(|e| self.corrupted(position, e.to_string()))?;
            if first {
                content_length = RecordMetadata::decode(chunk.payload())
                    .map_err(|e| self.corrupted(position, e.to_string()))?
                    .content_length;
            }

            self.free_space_map
                .update_page_free_space(op, page_index, free)?;
            pages.push((page_index, slot));
            current = chunk.next();
        }

        Ok(Some(DeletedChain {
            pages,
            content_length,
        }))
    }

    fn update_record(
        &self,
        op: &mut AtomicOperation,
        position: u64,
        content: &[u8],
        version: u64,
        record_type: u8,
    ) -> Result<()> {
        check_content_size(content)?;

        let entry = self
            .position_map
            .get_filled(op, position)?
            .ok_or_else(|| self.not_found(position))?;
        let Some(deleted) = self.delete_chain(op, position, entry)? else {
            bail!(self.not_found(position));
        };

        let metadata = RecordMetadata {
            record_type,
            content_length: content.len(),
            position,
        };

        // Freed pages not handed out again keep the FSM value set while
        // deleting the old chain.
        let mut reusable = deleted.pages;
        let reused = self.serialize_record(
            op,
            content,
            &metadata,
            entry_size(content.len()),
            TAIL_POINTER,
            version,
            |_, _| Ok(reusable.pop().map(|(page_index, slot)| (page_index, Some(slot)))),
        )?;

        let chain = if reused.remaining > 0 {
            let next_pointer = reused
                .head
                .map_or(TAIL_POINTER, |(page_index, slot)| chunk_pointer(page_index, slot));
            let rest = self.serialize_record(
                op,
                content,
                &metadata,
                reused.remaining,
                next_pointer,
                version,
                |op, bytes| Ok(Some((self.find_new_page(op, bytes)?, None))),
            )?;
            SerializedChain {
                head: rest.head.or(reused.head),
                remaining: rest.remaining,
            }
        } else {
            reused
        };
        let (page_index, slot) = self.finished_head(position, chain)?;

        let old_len = deleted.content_length as u64;
        let new_len = content.len() as u64;
        self.update_state(op, |state| {
            let total = state.total_content_bytes().saturating_sub(old_len) + new_len;
            state.set_total_content_bytes(total);
        })?;

        if (page_index, slot) != (entry.page_index, entry.slot) {
            self.position_map.update(
                op,
                position,
                PositionEntry {
                    page_index,
                    slot,
                    version,
                },
            )
        } else {
            self.position_map.update_version(op, position, version)
        }
    }

    fn update_record_version(
        &self,
        op: &mut AtomicOperation,
        position: u64,
        version: u64,
    ) -> Result<()> {
        let entry = self
            .position_map
            .get_filled(op, position)?
            .ok_or_else(|| self.not_found(position))?;

        let slot = entry.slot as usize;
        let updated = self.is_data_page(op, entry.page_index)?
            && op.write_page(self.data.id()?, entry.page_index, |buf| {
                let mut page = DataPageMut::from_page(buf)?;
                let is_entry_point = matches!(
                    page.record(slot).map(Chunk::new),
                    Some(Ok(chunk)) if chunk.is_entry_point()
                );
                if !is_entry_point {
                    return Ok(false);
                }
                page.set_record_version(slot, version)
            })?;

        if !updated {
            bail!(self.not_found(position));
        }
        self.position_map.update_version(op, position, version)
    }

    fn delete_record(&self, op: &mut AtomicOperation, position: u64) -> Result<bool> {
        let Some(entry) = self.position_map.get_filled(op, position)? else {
            return Ok(false);
        };
        let Some(deleted) = self.delete_chain(op, position, entry)? else {
            return Ok(false);
        };

        let removed = deleted.content_length as u64;
        self.update_state(op, |state| {
            state.set_record_count(state.record_count().saturating_sub(1));
            state.set_total_content_bytes(state.total_content_bytes().saturating_sub(removed));
        })?;

        self.position_map.remove(op, position)?;
        Ok(true)
    }

    fn record_exists(&self, op: &AtomicOperation, position: u64) -> Result<bool> {
        let Some(entry) = self.position_map.get_filled(op, position)? else {
            return Ok(false);
        };
        if !self.is_data_page(op, entry.page_index)? {
            return Ok(false);
        }
        op.read_page(self.data.id()?, entry.page_index, |buf| {
            Ok(!DataPage::from_page(buf)?.is_deleted(entry.slot as usize))
        })
    }

    fn get_physical_position(
        &self,
        op: &AtomicOperation,
        position: u64,
    ) -> Result<Option<PhysicalPosition>> {
        let Some(entry) = self.position_map.get_filled(op, position)? else {
            return Ok(None);
        };
        if !self.is_data_page(op, entry.page_index)? {
            return Ok(None);
        }

        let slot = entry.slot as usize;
        op.read_page(self.data.id()?, entry.page_index, |buf| {
            let page = DataPage::from_page(buf)?;
            let Some(Ok(chunk)) = page.record(slot).map(Chunk::new) else {
                return Ok(None);
            };
            if !chunk.is_entry_point() {
                return Ok(None);
            }
            Ok(chunk.payload().first().map(|&record_type| PhysicalPosition {
                position,
                record_type,
                version: page.record_version(slot),
            }))
        })
    }

    fn next_page(
        &self,
        op: &AtomicOperation,
        cursor: Option<u64>,
        forward: bool,
    ) -> Result<Option<BrowsePage>> {
        let batch = self.config.effective_browse_batch_size();

        let entries: Vec<PositionMapEntry> = match (forward, cursor) {
            (true, None) => self.position_map.ceiling_entries(op, 0, batch)?,
            (true, Some(cursor)) => self.position_map.higher_entries(op, cursor, batch)?,
            (false, None) => self
                .position_map
                .lower_entries_reversed(op, u64::MAX, batch)?,
            (false, Some(cursor)) => self
                .position_map
                .lower_entries_reversed(op, cursor, batch)?,
        };

        let Some(last) = entries.last() else {
            return Ok(None);
        };
        let cursor = last.position;

        let mut records = Vec::with_capacity(entries.len());
        for PositionMapEntry { position, entry } in entries {
            records.push(BrowseEntry {
                position,
                record: self.read_chain(op, position, entry)?,
            });
        }

        Ok(Some(BrowsePage {
            entries: records,
            cursor,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AtomicOperationsManager;

    const PAGE: usize = 2048;

    fn setup() -> (AtomicOperationsManager, Collection) {
        let files = Arc::new(FileManager::in_memory(PAGE));
        let atomic = AtomicOperationsManager::new(Arc::clone(&files));
        let config = CollectionConfig::new(7, "people").page_size(PAGE);
        let collection = Collection::new(config, files).unwrap();
        atomic.execute(|op| collection.create(op)).unwrap();
        (atomic, collection)
    }

    fn create(atomic: &AtomicOperationsManager, collection: &Collection, content: &[u8]) -> u64 {
        atomic
            .execute(|op| collection.create_record(op, content, 1, 0x0D, None))
            .unwrap()
            .position
    }

    fn chain_length(atomic: &AtomicOperationsManager, collection: &Collection, position: u64) -> usize {
        atomic
            .read(|op| {
                let inner = collection.inner.read();
                let file = inner.data.id()?;
                let entry = inner.position_map.get_filled(op, position)?.unwrap();
                let mut current = Some((entry.page_index, entry.slot));
                let mut length = 0;
                while let Some((page_index, slot)) = current {
                    length += 1;
                    current = op.read_page(file, page_index, |buf| {
                        let page = DataPage::from_page(buf)?;
                        Ok(Chunk::new(page.record(slot as usize).unwrap())?.next())
                    })?;
                }
                Ok(length)
            })
            .unwrap()
    }

    #[test]
    fn min_chunk_room_reserves_whole_header() {
        assert_eq!(min_chunk_room(METADATA_SIZE), METADATA_SIZE + MIN_ENTRY_SIZE);
        assert_eq!(min_chunk_room(METADATA_SIZE + 1), MIN_ENTRY_SIZE + 1);
    }

    #[test]
    fn new_rejects_mismatched_page_size() {
        let files = Arc::new(FileManager::in_memory(PAGE));
        let config = CollectionConfig::new(1, "bad").page_size(PAGE * 2);
        assert!(Collection::new(config, files).is_err());
    }

    #[test]
    fn new_rejects_bad_name() {
        let files = Arc::new(FileManager::in_memory(PAGE));
        let config = CollectionConfig::new(1, "a/b").page_size(PAGE);
        let err = Collection::new(config, files).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CollectionError>(),
            Some(CollectionError::InvalidCollectionName { .. })
        ));
    }

    #[test]
    fn small_record_round_trip() {
        let (atomic, collection) = setup();
        let position = create(&atomic, &collection, b"hello world");

        let record = atomic.read(|op| collection.read_record(op, position)).unwrap();
        assert_eq!(record.content, b"hello world");
        assert_eq!(record.version, 1);
        assert_eq!(record.record_type, 0x0D);
        assert_eq!(chain_length(&atomic, &collection, position), 1);
    }

    #[test]
    fn large_record_spans_three_chunks() {
        let (atomic, collection) = setup();
        let content = vec![0x41u8; 5000];
        let position = create(&atomic, &collection, &content);

        assert!(chain_length(&atomic, &collection, position) >= 3);
        let record = atomic.read(|op| collection.read_record(op, position)).unwrap();
        assert_eq!(record.content, content);
    }

    #[test]
    fn counters_follow_create_update_delete() {
        let (atomic, collection) = setup();
        let a = create(&atomic, &collection, &[1u8; 100]);
        create(&atomic, &collection, &[2u8; 50]);

        atomic
            .execute(|op| collection.update_record(op, a, &[3u8; 30], 2, 0x0D))
            .unwrap();
        atomic
            .read(|op| {
                assert_eq!(collection.get_entries(op)?, 2);
                assert_eq!(collection.get_records_size(op)?, 80);
                Ok(())
            })
            .unwrap();

        assert!(atomic.execute(|op| collection.delete_record(op, a)).unwrap());
        atomic
            .read(|op| {
                assert_eq!(collection.get_entries(op)?, 1);
                assert_eq!(collection.get_records_size(op)?, 50);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn deleting_twice_reports_false() {
        let (atomic, collection) = setup();
        let position = create(&atomic, &collection, b"x");

        assert!(atomic.execute(|op| collection.delete_record(op, position)).unwrap());
        assert!(!atomic.execute(|op| collection.delete_record(op, position)).unwrap());
        assert!(!atomic.execute(|op| collection.delete_record(op, 999)).unwrap());
    }

    #[test]
    fn freed_pages_are_found_again() {
        let (atomic, collection) = setup();
        let position = create(&atomic, &collection, &[7u8; 1500]);
        let before = atomic
            .read(|op| collection.record_coordinates(op, position))
            .unwrap()
            .unwrap();

        atomic
            .execute(|op| collection.delete_record(op, position))
            .unwrap();
        let next = create(&atomic, &collection, &[8u8; 1500]);
        let after = atomic
            .read(|op| collection.record_coordinates(op, next))
            .unwrap()
            .unwrap();

        assert_eq!(before.page_index, after.page_index);
    }

    #[test]
    fn growing_update_moves_entry_point() {
        let (atomic, collection) = setup();
        let position = create(&atomic, &collection, &[1u8; 10]);
        let content = vec![9u8; 6000];

        atomic
            .execute(|op| collection.update_record(op, position, &content, 5, 0x0E))
            .unwrap();

        let record = atomic.read(|op| collection.read_record(op, position)).unwrap();
        assert_eq!(record.content, content);
        assert_eq!(record.version, 5);
        assert_eq!(record.record_type, 0x0E);
        assert!(chain_length(&atomic, &collection, position) >= 3);
    }

    #[test]
    fn shrinking_update_reuses_head_page() {
        let (atomic, collection) = setup();
        let position = create(&atomic, &collection, &vec![1u8; 5000]);

        atomic
            .execute(|op| collection.update_record(op, position, b"tiny", 2, 0x0D))
            .unwrap();

        let record = atomic.read(|op| collection.read_record(op, position)).unwrap();
        assert_eq!(record.content, b"tiny");
        assert_eq!(chain_length(&atomic, &collection, position), 1);
    }

    #[test]
    fn update_of_missing_record_is_not_found() {
        let (atomic, collection) = setup();
        let err = atomic
            .execute(|op| collection.update_record(op, 3, b"x", 1, 0))
            .unwrap_err();
        assert!(CollectionError::is_record_not_found(&err));
    }

    #[test]
    fn version_update_reaches_page_and_map() {
        let (atomic, collection) = setup();
        let position = create(&atomic, &collection, b"abc");

        atomic
            .execute(|op| collection.update_record_version(op, position, 42))
            .unwrap();

        atomic
            .read(|op| {
                assert_eq!(collection.read_record(op, position)?.version, 42);
                let physical = collection.get_physical_position(op, position)?.unwrap();
                assert_eq!(physical.version, Some(42));
                assert_eq!(physical.record_type, 0x0D);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn preallocated_position_is_filled() {
        let (atomic, collection) = setup();
        let allocated = atomic
            .execute(|op| collection.allocate_position(op, 3))
            .unwrap();
        assert_eq!(allocated.version, None);
        assert_eq!(
            atomic
                .read(|op| collection.get_record_status(op, allocated.position))
                .unwrap(),
            RecordStatus::Allocated
        );

        let created = atomic
            .execute(|op| {
                collection.create_record(op, b"later", 1, 3, Some(allocated.position))
            })
            .unwrap();
        assert_eq!(created.position, allocated.position);
        assert_eq!(
            atomic
                .read(|op| collection.get_record_status(op, created.position))
                .unwrap(),
            RecordStatus::Present
        );
    }

    #[test]
    fn filling_a_non_allocated_position_fails() {
        let (atomic, collection) = setup();
        let position = create(&atomic, &collection, b"a");
        assert!(atomic
            .execute(|op| collection.create_record(op, b"b", 1, 0, Some(position)))
            .is_err());
    }

    #[test]
    fn embedded_position_mismatch_is_corruption() {
        let (atomic, collection) = setup();
        let a = create(&atomic, &collection, b"first");
        let b = create(&atomic, &collection, b"second");

        atomic
            .execute(|op| {
                let inner = collection.inner.read();
                let entry = inner.position_map.get_filled(op, a)?.unwrap();
                inner.position_map.update(op, b, entry)
            })
            .unwrap();

        let err = atomic.read(|op| collection.read_record(op, b)).unwrap_err();
        assert!(CollectionError::is_corruption(&err));
    }

    /// Rewrites the entry-point chunk of `position` in place through `edit`.
    fn rewrite_head(
        atomic: &AtomicOperationsManager,
        collection: &Collection,
        position: u64,
        edit: impl FnOnce(&mut Vec<u8>),
    ) {
        atomic
            .execute(|op| {
                let inner = collection.inner.read();
                let file = inner.data.id()?;
                let entry = inner.position_map.get_filled(op, position)?.unwrap();
                op.write_page(file, entry.page_index, |buf| {
                    let mut page = DataPageMut::from_page(buf)?;
                    let mut bytes = page.delete_record(entry.slot as usize)?.unwrap();
                    edit(&mut bytes);
                    let slot = page.append_record_at(entry.version, &bytes, Some(entry.slot))?;
                    assert_eq!(slot, Some(entry.slot));
                    Ok(())
                })
            })
            .unwrap();
    }

    #[test]
    fn missing_middle_chunk_is_corruption() {
        let (atomic, collection) = setup();
        let position = create(&atomic, &collection, &vec![0x41u8; 5000]);
        assert_eq!(chain_length(&atomic, &collection, position), 3);

        atomic
            .execute(|op| {
                let inner = collection.inner.read();
                let file = inner.data.id()?;
                let head = inner.position_map.get_filled(op, position)?.unwrap();
                let (page_index, slot) = op.read_page(file, head.page_index, |buf| {
                    let page = DataPage::from_page(buf)?;
                    Ok(Chunk::new(page.record(head.slot as usize).unwrap())?.next())
                })?
                .unwrap();
                op.write_page(file, page_index, |buf| {
                    DataPageMut::from_page(buf)?.delete_record(slot as usize)?;
                    Ok(())
                })
            })
            .unwrap();

        let err = atomic
            .read(|op| collection.read_record(op, position))
            .unwrap_err();
        assert!(CollectionError::is_corruption(&err));
        assert!(!CollectionError::is_record_not_found(&err));
    }

    #[test]
    fn content_length_past_assembled_bytes_is_corruption() {
        let (atomic, collection) = setup();
        let position = create(&atomic, &collection, b"short");

        rewrite_head(&atomic, &collection, position, |bytes| {
            bytes[1..5].copy_from_slice(&50i32.to_le_bytes());
        });

        let err = atomic
            .read(|op| collection.read_record(op, position))
            .unwrap_err();
        assert!(CollectionError::is_corruption(&err));
    }

    #[test]
    fn deleting_record_with_bad_metadata_is_corruption() {
        let (atomic, collection) = setup();
        let position = create(&atomic, &collection, b"short");

        rewrite_head(&atomic, &collection, position, |bytes| {
            bytes[1..5].copy_from_slice(&(-1i32).to_le_bytes());
        });

        let err = atomic
            .execute(|op| collection.delete_record(op, position))
            .unwrap_err();
        assert!(CollectionError::is_corruption(&err));
        atomic
            .read(|op| {
                assert_eq!(collection.get_entries(op)?, 1);
                assert_eq!(collection.get_records_size(op)?, 5);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn configure_renames_components_before_create() {
        let files = Arc::new(FileManager::in_memory(PAGE));
        let config = CollectionConfig::new(1, "draft").page_size(PAGE);
        let collection = Collection::new(config, files).unwrap();

        collection.configure(9, "final").unwrap();

        assert_eq!(collection.id(), 9);
        assert_eq!(collection.name(), "final");
        assert_eq!(collection.file_name(), "final.pcl");
    }

    #[test]
    fn configure_is_rejected_once_open() {
        let (_atomic, collection) = setup();
        assert!(collection.configure(2, "other").is_err());
    }
}
