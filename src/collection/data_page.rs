//! # Data Page
//!
//! Slotted page holding record chunks. The slot directory grows forward from
//! the header, chunk bytes grow backward from the end of the page:
//!
//! ```text
//! +--------------+-------------------+----------+---------------------+
//! | PageHeader   | slot directory -> |   free   | <- chunk area       |
//! | (16 bytes)   | 12 bytes / slot   |          | (+ deleted holes)   |
//! +--------------+-------------------+----------+---------------------+
//!                ^ 16                ^ free_start ^ free_end          ^ page_size
//! ```
//!
//! ## Slot (12 bytes)
//!
//! ```text
//! [offset U16][length U16][version U64]
//! ```
//!
//! `offset == 0` marks a deleted slot. Deleted slots are reused by the next
//! append; deleting the last slots shrinks the directory instead. Bytes of
//! deleted chunks stay where they are and are counted in the header's
//! `fragmented` field until an append needs them and compacts the page.
//!
//! ## Space Accounting
//!
//! ```text
//! free_space      = (free_end - free_start) + fragmented
//! max_record_size = free_space - (0 if a deleted slot can be reused, else 12)
//! ```
//!
//! `max_record_size` is the value reported to the free-space map.

use eyre::{ensure, eyre, Result};
use zerocopy::little_endian::{U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{PAGE_HEADER_SIZE, SLOT_SIZE};
use crate::storage::{PageHeader, PageType};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct Slot {
    offset: U16,
    length: U16,
    version: U64,
}

const _: () = assert!(std::mem::size_of::<Slot>() == SLOT_SIZE);

impl Slot {
    fn is_deleted(&self) -> bool {
        self.offset.get() == 0
    }
}

fn split_page(data: &[u8]) -> Result<(&PageHeader, &[u8])> {
    let (head, body) = data.split_at(PAGE_HEADER_SIZE.min(data.len()));
    let header = PageHeader::from_bytes(head)?;
    ensure!(
        header.page_type() == PageType::CollectionData,
        "expected CollectionData page, got {:?}",
        header.page_type()
    );
    Ok((header, body))
}

#[derive(Debug)]
pub(crate) struct DataPage<'a> {
    header: &'a PageHeader,
    body: &'a [u8],
}

pub(crate) struct DataPageMut<'a> {
    header: &'a mut PageHeader,
    body: &'a mut [u8],
}

impl<'a> DataPage<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        let (header, body) = split_page(data)?;
        Ok(Self { header, body })
    }

    pub fn slot_count(&self) -> usize {
        self.header.slot_count() as usize
    }

    fn slot(&self, index: usize) -> Option<&'a Slot> {
        if index >= self.slot_count() {
            return None;
        }
        let start = index * SLOT_SIZE;
        let bytes = self.body.get(start..start + SLOT_SIZE)?;
        Slot::ref_from_bytes(bytes).ok()
    }

    fn live_slot(&self, index: usize) -> Option<&'a Slot> {
        self.slot(index).filter(|slot| !slot.is_deleted())
    }

    pub fn is_deleted(&self, index: usize) -> bool {
        self.live_slot(index).is_none()
    }

    /// Chunk bytes stored in slot `index`, `None` if the slot is deleted.
    pub fn record(&self, index: usize) -> Option<&'a [u8]> {
        let slot = self.live_slot(index)?;
        let start = (slot.offset.get() as usize).checked_sub(PAGE_HEADER_SIZE)?;
        self.body.get(start..start + slot.length.get() as usize)
    }

    pub fn record_version(&self, index: usize) -> Option<u64> {
        self.live_slot(index).map(|slot| slot.version.get())
    }

    #[cfg(test)]
    pub fn record_count(&self) -> usize {
        (0..self.slot_count())
            .filter(|&index| !self.is_deleted(index))
            .count()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    fn first_deleted_slot(&self) -> Option<usize> {
        (0..self.slot_count()).find(|&index| self.is_deleted(index))
    }

    fn contiguous_free(&self) -> usize {
        self.header.contiguous_free() as usize
    }

    pub fn free_space(&self) -> usize {
        self.contiguous_free() + self.header.fragmented() as usize
    }

    /// Largest chunk a single append can store on this page.
    pub fn max_record_size(&self) -> usize {
        let directory_growth = if self.first_deleted_slot().is_some() {
            0
        } else {
            SLOT_SIZE
        };
        self.free_space().saturating_sub(directory_growth)
    }
}

impl<'a> DataPageMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        split_page(data)?;
        let (head, body) = data.split_at_mut(PAGE_HEADER_SIZE);
        Ok(Self {
            header: PageHeader::from_bytes_mut(head)?,
            body,
        })
    }

    pub fn init(data: &'a mut [u8]) -> Result<Self> {
        let page_size = data.len();
        data.fill(0);
        PageHeader::new(PageType::CollectionData, page_size).write_to(data)?;
        Self::from_page(data)
    }

    fn view(&self) -> DataPage<'_> {
        DataPage {
            header: &*self.header,
            body: &*self.body,
        }
    }

    pub fn max_record_size(&self) -> usize {
        self.view().max_record_size()
    }

    #[cfg(test)]
    pub fn free_space(&self) -> usize {
        self.view().free_space()
    }

    #[cfg(test)]
    pub fn is_deleted(&self, index: usize) -> bool {
        self.view().is_deleted(index)
    }

    pub fn record(&self, index: usize) -> Option<&[u8]> {
        self.view().record(index)
    }

    fn page_size(&self) -> usize {
        self.body.len() + PAGE_HEADER_SIZE
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut Slot> {
        ensure!(
            index < self.header.slot_count() as usize,
            "slot index {} out of bounds (slot_count={})",
            index,
            self.header.slot_count()
        );
        let start = index * SLOT_SIZE;
        Slot::mut_from_bytes(&mut self.body[start..start + SLOT_SIZE])
            .map_err(|e| eyre!("failed to read slot {}: {:?}", index, e))
    }

    /// Stores `record` and returns its slot, or `None` when the page cannot
    /// hold it even after compaction.
    #[cfg(test)]
    pub fn append_record(&mut self, version: u64, record: &[u8]) -> Result<Option<u16>> {
        self.append_record_at(version, record, None)
    }

    /// Like `append_record`, but takes slot `preferred` when it is free and
    /// the page has room for it. Slots past the directory end are reached by
    /// growing the directory with deleted slots.
    pub fn append_record_at(
        &mut self,
        version: u64,
        record: &[u8],
        preferred: Option<u16>,
    ) -> Result<Option<u16>> {
        let placement = preferred
            .and_then(|index| self.preferred_placement(index as usize, record.len()))
            .or_else(|| self.default_placement(record.len()));
        let Some((index, directory_growth)) = placement else {
            return Ok(None);
        };

        if record.len() + directory_growth > self.view().contiguous_free() {
            self.compact()?;
        }

        if directory_growth > 0 {
            let start = self.header.free_start() as usize - PAGE_HEADER_SIZE;
            self.body[start..start + directory_growth].fill(0);
            self.header.set_slot_count((index + 1) as u16);
            self.header
                .set_free_start(self.header.free_start() + directory_growth as u16);
        }

        let offset = self.header.free_end() as usize - record.len();
        let start = offset - PAGE_HEADER_SIZE;
        self.body[start..start + record.len()].copy_from_slice(record);
        self.header.set_free_end(offset as u16);

        let slot = self.slot_mut(index)?;
        slot.offset = U16::new(offset as u16);
        slot.length = U16::new(record.len() as u16);
        slot.version = U64::new(version);
        Ok(Some(index as u16))
    }

    /// Slot index and directory growth for a plain append.
    fn default_placement(&self, len: usize) -> Option<(usize, usize)> {
        let view = self.view();
        let placement = match view.first_deleted_slot() {
            Some(index) => (index, 0),
            None => (view.slot_count(), SLOT_SIZE),
        };
        (len + placement.1 <= view.free_space()).then_some(placement)
    }

    fn preferred_placement(&self, index: usize, len: usize) -> Option<(usize, usize)> {
        let view = self.view();
        let slot_count = view.slot_count();
        let placement = if index < slot_count {
            if !view.is_deleted(index) {
                return None;
            }
            (index, 0)
        } else {
            (index, (index + 1 - slot_count) * SLOT_SIZE)
        };
        (len + placement.1 <= view.free_space()).then_some(placement)
    }

    /// Deletes slot `index` and returns the chunk bytes it held.
    pub fn delete_record(&mut self, index: usize) -> Result<Option<Vec<u8>>> {
        let Some(content) = self.view().record(index).map(<[u8]>::to_vec) else {
            return Ok(None);
        };

        let slot = self.slot_mut(index)?;
        let offset = slot.offset.get();
        let length = slot.length.get();
        slot.offset = U16::new(0);
        slot.length = U16::new(0);
        slot.version = U64::new(0);

        if offset == self.header.free_end() {
            self.header.set_free_end(offset + length);
        } else {
            self.header
                .set_fragmented(self.header.fragmented() + length);
        }

        while self.header.slot_count() > 0 {
            let last = self.header.slot_count() as usize - 1;
            if !self.view().is_deleted(last) {
                break;
            }
            self.header.set_slot_count(last as u16);
            self.header
                .set_free_start(self.header.free_start() - SLOT_SIZE as u16);
        }

        if self.header.slot_count() == 0 {
            let page_size = self.page_size() as u16;
            self.header.set_free_end(page_size);
            self.header.set_fragmented(0);
        }

        Ok(Some(content))
    }

    pub fn set_record_version(&mut self, index: usize, version: u64) -> Result<bool> {
        if self.view().is_deleted(index) {
            return Ok(false);
        }
        self.slot_mut(index)?.version = U64::new(version);
        Ok(true)
    }

    /// Moves every live chunk to the end of the page, folding deleted holes
    /// into the contiguous gap.
    fn compact(&mut self) -> Result<()> {
        let view = self.view();
        let mut live: Vec<(usize, usize, usize)> = (0..view.slot_count())
            .filter_map(|index| {
                view.live_slot(index)
                    .map(|slot| (index, slot.offset.get() as usize, slot.length.get() as usize))
            })
            .collect();
        live.sort_unstable_by(|a, b| b.1.cmp(&a.1));

        let mut end = self.page_size();
        for (index, offset, length) in live {
            end -= length;
            if end != offset {
                let from = offset - PAGE_HEADER_SIZE;
                self.body
                    .copy_within(from..from + length, end - PAGE_HEADER_SIZE);
            }
            self.slot_mut(index)?.offset = U16::new(end as u16);
        }

        self.header.set_free_end(end as u16);
        self.header.set_fragmented(0);
        Ok(())
    }
}
