//! # Page Types and Header Layout
//!
//! Every page of every collection file begins with the same 16-byte header.
//! The page size itself is a property of the collection, so the header stores
//! offsets only and never assumes a fixed page size.
//!
//! ## Page Header Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field        Description
//! ------  ----  -----------  ----------------------------------------
//! 0       1     page_type    Type of page (CollectionData, PositionMapBucket, ...)
//! 1       1     flags        Page flags (reserved, zero)
//! 2       2     slot_count   Number of slot directory entries
//! 4       2     free_start   Offset where free space begins (end of slot directory)
//! 6       2     free_end     Offset where free space ends (start of chunk area)
//! 8       2     fragmented   Bytes of deleted chunks inside the chunk area
//! 10      2     reserved     Reserved for future use
//! 12      4     checksum     Reserved for page checksums, zero
//! ```
//!
//! Only data pages use the slot fields; the other page types keep them at
//! their initial values and store their own layout after the header.
//!
//! ## Page Types
//!
//! - **CollectionState** (0x01): page 0 of the data file, record counters
//! - **CollectionData** (0x02): slotted page holding record chunks
//! - **PositionMapEntryPoint** (0x10): page 0 of the position map file
//! - **PositionMapBucket** (0x11): fixed-capacity array of position entries
//! - **FreeSpaceMap** (0x20): in-page segment tree of normalized free space
//!
//! ## Zero-Copy Access
//!
//! `PageHeader` uses `zerocopy` little-endian wrappers so headers can be read
//! in place from any page buffer, aligned or not:
//!
//! ```text
//! let header = PageHeader::from_bytes(&page_data)?;
//! ```

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::PAGE_HEADER_SIZE;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    CollectionState = 0x01,
    CollectionData = 0x02,
    PositionMapEntryPoint = 0x10,
    PositionMapBucket = 0x11,
    FreeSpaceMap = 0x20,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::CollectionState,
            0x02 => PageType::CollectionData,
            0x10 => PageType::PositionMapEntryPoint,
            0x11 => PageType::PositionMapBucket,
            0x20 => PageType::FreeSpaceMap,
            _ => PageType::Unknown,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    page_type: u8,
    flags: u8,
    slot_count: U16,
    free_start: U16,
    free_end: U16,
    fragmented: U16,
    reserved: [u8; 2],
    checksum: U32,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

impl PageHeader {
    pub fn new(page_type: PageType, page_size: usize) -> Self {
        Self {
            page_type: page_type as u8,
            flags: 0,
            slot_count: U16::new(0),
            free_start: U16::new(PAGE_HEADER_SIZE as u16),
            free_end: U16::new(page_size as u16),
            fragmented: U16::new(0),
            reserved: [0; 2],
            checksum: U32::new(0),
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        data[..PAGE_HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_byte(self.page_type)
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.page_type = page_type as u8;
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.flags = flags;
    }

    zerocopy_accessors! {
        slot_count: u16,
        free_start: u16,
        free_end: u16,
        fragmented: u16,
    }

    /// Contiguous gap between the slot directory and the chunk area.
    pub fn contiguous_free(&self) -> u16 {
        self.free_end().saturating_sub(self.free_start())
    }
}

/// Checks that `data` is a page of `page_size` bytes carrying `expected` in
/// its header and that the free pointers are consistent.
pub fn validate_page(data: &[u8], page_size: usize, expected: PageType) -> Result<()> {
    ensure!(
        data.len() == page_size,
        "invalid page size: {} != {}",
        data.len(),
        page_size
    );

    let header = PageHeader::from_bytes(data)?;

    ensure!(
        header.page_type() == expected,
        "unexpected page type: {:?} (expected {:?})",
        header.page_type(),
        expected
    );

    ensure!(
        header.free_start() as usize >= PAGE_HEADER_SIZE,
        "free_start {} < PAGE_HEADER_SIZE {}",
        header.free_start(),
        PAGE_HEADER_SIZE
    );

    ensure!(
        header.free_end() as usize <= page_size,
        "free_end {} > page size {}",
        header.free_end(),
        page_size
    );

    ensure!(
        header.free_start() <= header.free_end(),
        "free_start {} > free_end {}",
        header.free_start(),
        header.free_end()
    );

    Ok(())
}
