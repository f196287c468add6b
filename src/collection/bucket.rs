//! # Position Map Bucket
//!
//! A bucket page is a fixed-capacity array of position entries. Bucket `N`
//! covers logical positions `[N * CAPACITY, (N + 1) * CAPACITY)` and entries
//! are only ever appended, so `size` is the number of positions handed out
//! from this bucket.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------
//! 0       16    PageHeader (PositionMapBucket)
//! 16      4     size (entries in use)
//! 20      4     reserved
//! 24      15*N  entries
//! ```
//!
//! ## Entry (15 bytes)
//!
//! ```text
//! [status u8][page_index u32][slot u16][version u64]
//! ```
//!
//! | Status      | Byte | Coordinates kept |
//! |-------------|------|------------------|
//! | NotExistent | 0    | no               |
//! | Removed     | 1    | yes              |
//! | Filled      | 2    | yes              |
//! | Allocated   | 4    | no               |

use eyre::{ensure, eyre, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{bucket_capacity_for, BUCKET_ENTRY_SIZE, BUCKET_HEADER_SIZE};
use crate::storage::{PageHeader, PageType};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PositionStatus {
    NotExistent = 0,
    Removed = 1,
    Filled = 2,
    Allocated = 4,
}

impl PositionStatus {
    pub fn from_byte(b: u8) -> Self {
        match b {
            1 => PositionStatus::Removed,
            2 => PositionStatus::Filled,
            4 => PositionStatus::Allocated,
            _ => PositionStatus::NotExistent,
        }
    }
}

/// Physical coordinates of a record's entry-point chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PositionEntry {
    pub page_index: u32,
    pub slot: u16,
    pub version: u64,
}

/// Decoded bucket slot. Never-allocated slots are reported as `None` by the
/// lookups returning this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapEntry {
    Allocated,
    Filled(PositionEntry),
    Removed(PositionEntry),
}

impl MapEntry {
    pub fn status(&self) -> PositionStatus {
        match self {
            MapEntry::Allocated => PositionStatus::Allocated,
            MapEntry::Filled(_) => PositionStatus::Filled,
            MapEntry::Removed(_) => PositionStatus::Removed,
        }
    }

    pub fn filled(&self) -> Option<PositionEntry> {
        match self {
            MapEntry::Filled(entry) => Some(*entry),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BucketHeader {
    page: PageHeader,
    size: U32,
    reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<BucketHeader>() == BUCKET_HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RawEntry {
    status: u8,
    page_index: U32,
    slot: U16,
    version: U64,
}

const _: () = assert!(std::mem::size_of::<RawEntry>() == BUCKET_ENTRY_SIZE);

impl RawEntry {
    fn coordinates(&self) -> PositionEntry {
        PositionEntry {
            page_index: self.page_index.get(),
            slot: self.slot.get(),
            version: self.version.get(),
        }
    }

    fn decode(&self) -> Option<MapEntry> {
        match PositionStatus::from_byte(self.status) {
            PositionStatus::NotExistent => None,
            PositionStatus::Allocated => Some(MapEntry::Allocated),
            PositionStatus::Filled => Some(MapEntry::Filled(self.coordinates())),
            PositionStatus::Removed => Some(MapEntry::Removed(self.coordinates())),
        }
    }
}

fn entry_offset(index: usize) -> usize {
    BUCKET_HEADER_SIZE + index * BUCKET_ENTRY_SIZE
}

fn check_page(data: &[u8]) -> Result<()> {
    let header = PageHeader::from_bytes(data)?;
    ensure!(
        header.page_type() == PageType::PositionMapBucket,
        "expected PositionMapBucket page, got {:?}",
        header.page_type()
    );
    Ok(())
}

#[derive(Debug)]
pub(crate) struct Bucket<'a> {
    data: &'a [u8],
    capacity: usize,
}

pub(crate) struct BucketMut<'a> {
    data: &'a mut [u8],
    capacity: usize,
}

impl<'a> Bucket<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        check_page(data)?;
        Ok(Self {
            capacity: bucket_capacity_for(data.len()),
            data,
        })
    }

    fn header(&self) -> Result<&BucketHeader> {
        BucketHeader::ref_from_bytes(&self.data[..BUCKET_HEADER_SIZE])
            .map_err(|e| eyre!("failed to read bucket header: {:?}", e))
    }

    pub fn size(&self) -> Result<usize> {
        Ok(self.header()?.size.get() as usize)
    }

    pub fn is_full(&self) -> Result<bool> {
        Ok(self.size()? >= self.capacity)
    }

    fn raw(&self, index: usize) -> Result<&RawEntry> {
        ensure!(
            index < self.capacity,
            "bucket index {} out of bounds (capacity={})",
            index,
            self.capacity
        );
        let offset = entry_offset(index);
        RawEntry::ref_from_bytes(&self.data[offset..offset + BUCKET_ENTRY_SIZE])
            .map_err(|e| eyre!("failed to read bucket entry {}: {:?}", index, e))
    }

    /// Entry at `index`, `None` past `size` or for never-allocated slots.
    pub fn get(&self, index: usize) -> Result<Option<MapEntry>> {
        if index >= self.size()? {
            return Ok(None);
        }
        Ok(self.raw(index)?.decode())
    }

    pub fn status(&self, index: usize) -> Result<PositionStatus> {
        if index >= self.size()? {
            return Ok(PositionStatus::NotExistent);
        }
        Ok(PositionStatus::from_byte(self.raw(index)?.status))
    }

    #[cfg(test)]
    pub fn is_filled(&self, index: usize) -> Result<bool> {
        Ok(self.status(index)? == PositionStatus::Filled)
    }
}

impl<'a> BucketMut<'a> {
    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        check_page(data)?;
        Ok(Self {
            capacity: bucket_capacity_for(data.len()),
            data,
        })
    }

    pub fn init(data: &'a mut [u8]) -> Result<Self> {
        let page_size = data.len();
        data.fill(0);
        PageHeader::new(PageType::PositionMapBucket, page_size).write_to(data)?;
        Ok(Self {
            capacity: bucket_capacity_for(page_size),
            data,
        })
    }

    fn view(&self) -> Bucket<'_> {
        Bucket {
            data: &*self.data,
            capacity: self.capacity,
        }
    }

    fn header_mut(&mut self) -> Result<&mut BucketHeader> {
        BucketHeader::mut_from_bytes(&mut self.data[..BUCKET_HEADER_SIZE])
            .map_err(|e| eyre!("failed to read bucket header: {:?}", e))
    }

    fn raw_mut(&mut self, index: usize) -> Result<&mut RawEntry> {
        let size = self.view().size()?;
        ensure!(
            index < size,
            "bucket index {} out of bounds (size={})",
            index,
            size
        );
        let offset = entry_offset(index);
        RawEntry::mut_from_bytes(&mut self.data[offset..offset + BUCKET_ENTRY_SIZE])
            .map_err(|e| eyre!("failed to read bucket entry {}: {:?}", index, e))
    }

    pub fn size(&self) -> Result<usize> {
        self.view().size()
    }

    #[cfg(test)]
    pub fn is_full(&self) -> Result<bool> {
        self.view().is_full()
    }

    /// Appends an Allocated entry and returns its index within the bucket.
    pub fn allocate(&mut self) -> Result<usize> {
        let index = self.size()?;
        ensure!(index < self.capacity, "bucket is full ({} entries)", index);

        self.header_mut()?.size = U32::new(index as u32 + 1);
        let entry = self.raw_mut(index)?;
        entry.status = PositionStatus::Allocated as u8;
        entry.page_index = U32::new(0);
        entry.slot = U16::new(0);
        entry.version = U64::new(0);
        Ok(index)
    }

    pub fn set(&mut self, index: usize, value: PositionEntry) -> Result<()> {
        let entry = self.raw_mut(index)?;
        entry.status = PositionStatus::Filled as u8;
        entry.page_index = U32::new(value.page_index);
        entry.slot = U16::new(value.slot);
        entry.version = U64::new(value.version);
        Ok(())
    }

    pub fn set_version(&mut self, index: usize, version: u64) -> Result<()> {
        self.raw_mut(index)?.version = U64::new(version);
        Ok(())
    }

    /// Marks the entry Removed; coordinates and version stay readable.
    pub fn remove(&mut self, index: usize) -> Result<()> {
        self.raw_mut(index)?.status = PositionStatus::Removed as u8;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 2048;

    #[test]
    fn capacity_follows_page_size() {
        let mut page = vec![0u8; PAGE];
        let bucket = BucketMut::init(&mut page).unwrap();
        assert_eq!(bucket.capacity, (PAGE - 24) / 15);
        assert_eq!(bucket.size().unwrap(), 0);
    }

    #[test]
    fn allocate_then_fill_then_remove() {
        let mut page = vec![0u8; PAGE];
        let mut bucket = BucketMut::init(&mut page).unwrap();

        let index = bucket.allocate().unwrap();
        assert_eq!(index, 0);

        let coords = PositionEntry {
            page_index: 7,
            slot: 3,
            version: 11,
        };
        bucket.set(index, coords).unwrap();
        bucket.remove(index).unwrap();

        let bucket = Bucket::from_page(&page).unwrap();
        assert_eq!(bucket.get(0).unwrap(), Some(MapEntry::Removed(coords)));
        assert_eq!(bucket.status(0).unwrap(), PositionStatus::Removed);
        assert_eq!(bucket.get(1).unwrap(), None);
        assert_eq!(bucket.status(1).unwrap(), PositionStatus::NotExistent);
    }

    #[test]
    fn allocated_entry_has_no_coordinates() {
        let mut page = vec![0u8; PAGE];
        let mut bucket = BucketMut::init(&mut page).unwrap();
        bucket.allocate().unwrap();
        bucket.set_version(0, 9).unwrap();

        let bucket = Bucket::from_page(&page).unwrap();
        assert_eq!(bucket.get(0).unwrap(), Some(MapEntry::Allocated));
        assert_eq!(bucket.get(0).unwrap().and_then(|e| e.filled()), None);
        assert!(!bucket.is_filled(0).unwrap());
    }

    #[test]
    fn full_bucket_rejects_allocation() {
        let mut page = vec![0u8; PAGE];
        let mut bucket = BucketMut::init(&mut page).unwrap();
        for _ in 0..bucket.capacity {
            bucket.allocate().unwrap();
        }

        assert!(bucket.is_full().unwrap());
        assert!(bucket.allocate().is_err());
    }

    #[test]
    fn writes_past_size_fail() {
        let mut page = vec![0u8; PAGE];
        let mut bucket = BucketMut::init(&mut page).unwrap();
        assert!(bucket.set_version(0, 1).is_err());
    }

    #[test]
    fn rejects_foreign_page() {
        let mut page = vec![0u8; PAGE];
        PageHeader::new(PageType::FreeSpaceMap, PAGE)
            .write_to(&mut page)
            .unwrap();
        assert!(Bucket::from_page(&page).is_err());
    }
}
