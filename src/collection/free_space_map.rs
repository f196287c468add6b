//! # Free-Space Map
//!
//! Answers "which data page has at least N free bytes?" without scanning the
//! data file. The map is a two-level arrangement of segment-tree pages:
//!
//! ```text
//!                 page 0 (first level)
//!        leaf g = max free space of group g
//!       /            |                 \
//!   page 1         page 2     ...    page g+1 (second level)
//!   leaf i = free space of data page  g * LEAVES + i
//! ```
//!
//! `LEAVES` is the leaf count of one tree page, so the map addresses at most
//! `LEAVES * LEAVES` data pages. Second-level pages are created lazily the
//! first time a page of their group is updated; missing groups read as empty.
//!
//! ## Normalization
//!
//! Free space is stored as one byte with `interval = page_size / 256`:
//!
//! ```text
//! stored value   = min(free_bytes / interval, 255)         (rounds down)
//! search value   = required_bytes / interval + 1           (rounds up)
//! ```
//!
//! Rounding in opposite directions means a page returned by `find_free_page`
//! always has at least the requested number of bytes. A request needing a
//! search value above 255 cannot be answered and yields `None`.

use eyre::{bail, Result};

use super::component::ComponentFile;
use super::fsm_page::SegmentTree;
use crate::config::{
    normalization_interval_for, FREE_SPACE_MAP_FILE_EXTENSION, FSM_MAX_NORMALIZED,
};
use crate::error::CollectionError;
use crate::storage::{AtomicOperation, FileManager};

#[derive(Debug, Clone)]
pub struct FreeSpaceMap {
    file: ComponentFile,
    tree: SegmentTree,
    interval: usize,
}

impl FreeSpaceMap {
    pub fn new(collection_name: &str, page_size: usize) -> Self {
        Self {
            file: ComponentFile::new(collection_name, FREE_SPACE_MAP_FILE_EXTENSION),
            tree: SegmentTree::new(page_size),
            interval: normalization_interval_for(page_size),
        }
    }

    pub fn file_name(&self) -> String {
        self.file.full_name()
    }

    pub fn exists(&self, op: &AtomicOperation) -> bool {
        self.file.exists(op)
    }

    pub fn create(&mut self, op: &mut AtomicOperation) -> Result<()> {
        let file = self.file.create(op)?;
        let root = op.add_page(file)?;
        let tree = self.tree;
        op.write_page(file, root, |buf| tree.init(buf))
    }

    pub fn open(&mut self, op: &AtomicOperation) -> Result<()> {
        self.file.open(op)?;
        Ok(())
    }

    pub fn delete(&mut self, op: &mut AtomicOperation) -> Result<()> {
        self.file.delete(op)
    }

    pub fn rename(&mut self, op: &mut AtomicOperation, new_collection_name: &str) -> Result<()> {
        self.file.rename(op, new_collection_name)
    }

    pub fn flush(&self, files: &FileManager) -> Result<()> {
        self.file.flush(files)
    }

    pub fn close(&mut self, files: &FileManager, flush: bool) -> Result<()> {
        self.file.close(files, flush)
    }

    /// Number of data pages the map can describe.
    pub fn capacity(&self) -> u64 {
        let leaves = self.tree.leaves() as u64;
        leaves * leaves
    }

    fn search_value(&self, required: usize) -> Option<u8> {
        let value = required / self.interval + 1;
        u8::try_from(value).ok()
    }

    fn stored_value(&self, free: usize) -> u8 {
        (free / self.interval).min(FSM_MAX_NORMALIZED as usize) as u8
    }

    /// Leftmost data page with at least `required` free bytes.
    pub fn find_free_page(&self, op: &AtomicOperation, required: usize) -> Result<Option<u32>> {
        let Some(needed) = self.search_value(required) else {
            return Ok(None);
        };

        let file = self.file.id()?;
        let tree = self.tree;

        let group = op.read_page(file, 0, |buf| Ok(tree.find(buf, needed)))?;
        let Some(group) = group else {
            return Ok(None);
        };

        let second_level = group as u32 + 1;
        if second_level >= op.filled_up_to(file)? {
            return Ok(None);
        }

        let leaf = op.read_page(file, second_level, |buf| Ok(tree.find(buf, needed)))?;
        Ok(leaf.map(|leaf| (group * tree.leaves() + leaf) as u32))
    }

    /// Records that data page `page_index` now has `free` bytes available.
    pub fn update_page_free_space(
        &self,
        op: &mut AtomicOperation,
        page_index: u32,
        free: usize,
    ) -> Result<()> {
        let leaves = self.tree.leaves();
        let group = page_index as usize / leaves;
        let leaf = page_index as usize % leaves;

        if group >= leaves {
            bail!(CollectionError::PageIndexOutOfRange {
                page_index,
                capacity: self.capacity(),
            });
        }

        let file = self.file.id()?;
        let tree = self.tree;
        let second_level = group as u32 + 1;

        while op.filled_up_to(file)? <= second_level {
            let page = op.add_page(file)?;
            op.write_page(file, page, |buf| tree.init(buf))?;
        }

        let value = self.stored_value(free);
        let group_max = op.write_page(file, second_level, |buf| tree.update(buf, leaf, value))?;
        op.write_page(file, 0, |buf| tree.update(buf, group, group_max))?;
        Ok(())
    }
}
