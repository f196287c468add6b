//! # Header Pages
//!
//! Page 0 of the data file and page 0 of the position map file carry small
//! fixed headers instead of records or entries.
//!
//! ## Collection State (data file, page 0)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -------------------
//! 0       16    PageHeader (CollectionState)
//! 16      8     record_count
//! 24      8     total_content_bytes
//! 32      8     file_size (data pages in use, excluding page 0)
//! ```
//!
//! ## Position Map Entry Point (position map file, page 0)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -------------------
//! 0       16    PageHeader (PositionMapEntryPoint)
//! 16      8     bucket_file_size (number of bucket pages)
//! ```

use eyre::{ensure, eyre, Result};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::PAGE_HEADER_SIZE;
use crate::storage::{PageHeader, PageType};

pub(crate) const STATE_PAGE_SIZE: usize = PAGE_HEADER_SIZE + 24;
pub(crate) const ENTRY_POINT_SIZE: usize = PAGE_HEADER_SIZE + 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct StatePage {
    header: PageHeader,
    record_count: U64,
    total_content_bytes: U64,
    file_size: U64,
}

const _: () = assert!(std::mem::size_of::<StatePage>() == STATE_PAGE_SIZE);

impl StatePage {
    pub fn init(data: &mut [u8]) -> Result<&mut Self> {
        let page_size = data.len();
        data.fill(0);
        PageHeader::new(PageType::CollectionState, page_size).write_to(data)?;
        Self::from_bytes_mut(data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= STATE_PAGE_SIZE,
            "buffer too small for StatePage: {} < {}",
            data.len(),
            STATE_PAGE_SIZE
        );
        let state = Self::ref_from_bytes(&data[..STATE_PAGE_SIZE])
            .map_err(|e| eyre!("failed to read StatePage: {:?}", e))?;
        ensure!(
            state.header.page_type() == PageType::CollectionState,
            "expected CollectionState page, got {:?}",
            state.header.page_type()
        );
        Ok(state)
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= STATE_PAGE_SIZE,
            "buffer too small for StatePage: {} < {}",
            data.len(),
            STATE_PAGE_SIZE
        );
        let state = Self::mut_from_bytes(&mut data[..STATE_PAGE_SIZE])
            .map_err(|e| eyre!("failed to read StatePage: {:?}", e))?;
        ensure!(
            state.header.page_type() == PageType::CollectionState,
            "expected CollectionState page, got {:?}",
            state.header.page_type()
        );
        Ok(state)
    }

    zerocopy_accessors! {
        record_count: u64,
        total_content_bytes: u64,
        file_size: u64,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct MapEntryPoint {
    header: PageHeader,
    bucket_file_size: U64,
}

const _: () = assert!(std::mem::size_of::<MapEntryPoint>() == ENTRY_POINT_SIZE);

impl MapEntryPoint {
    pub fn init(data: &mut [u8]) -> Result<&mut Self> {
        let page_size = data.len();
        data.fill(0);
        PageHeader::new(PageType::PositionMapEntryPoint, page_size).write_to(data)?;
        Self::from_bytes_mut(data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= ENTRY_POINT_SIZE,
            "buffer too small for MapEntryPoint: {} < {}",
            data.len(),
            ENTRY_POINT_SIZE
        );
        let entry_point = Self::ref_from_bytes(&data[..ENTRY_POINT_SIZE])
            .map_err(|e| eyre!("failed to read MapEntryPoint: {:?}", e))?;
        ensure!(
            entry_point.header.page_type() == PageType::PositionMapEntryPoint,
            "expected PositionMapEntryPoint page, got {:?}",
            entry_point.header.page_type()
        );
        Ok(entry_point)
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= ENTRY_POINT_SIZE,
            "buffer too small for MapEntryPoint: {} < {}",
            data.len(),
            ENTRY_POINT_SIZE
        );
        let entry_point = Self::mut_from_bytes(&mut data[..ENTRY_POINT_SIZE])
            .map_err(|e| eyre!("failed to read MapEntryPoint: {:?}", e))?;
        ensure!(
            entry_point.header.page_type() == PageType::PositionMapEntryPoint,
            "expected PositionMapEntryPoint page, got {:?}",
            entry_point.header.page_type()
        );
        Ok(entry_point)
    }

    zerocopy_accessors! {
        bucket_file_size: u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_page_starts_empty() {
        let mut page = vec![0xAAu8; 1024];
        let state = StatePage::init(&mut page).unwrap();
        assert_eq!(state.record_count(), 0);
        assert_eq!(state.total_content_bytes(), 0);
        assert_eq!(state.file_size(), 0);
    }

    #[test]
    fn state_page_counters_persist_in_bytes() {
        let mut page = vec![0u8; 1024];
        {
            let state = StatePage::init(&mut page).unwrap();
            state.set_record_count(3);
            state.set_total_content_bytes(5000);
            state.set_file_size(4);
        }

        let state = StatePage::from_bytes(&page).unwrap();
        assert_eq!(state.record_count(), 3);
        assert_eq!(state.total_content_bytes(), 5000);
        assert_eq!(state.file_size(), 4);
        assert_eq!(&page[16..24], &3u64.to_le_bytes());
    }

    #[test]
    fn entry_point_tracks_bucket_count() {
        let mut page = vec![0u8; 1024];
        MapEntryPoint::init(&mut page)
            .unwrap()
            .set_bucket_file_size(2);

        assert_eq!(MapEntryPoint::from_bytes(&page).unwrap().bucket_file_size(), 2);
        assert!(StatePage::from_bytes(&page).is_err());
    }
}
