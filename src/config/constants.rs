//! # Layout Constants
//!
//! This module centralizes the on-disk layout constants of the record store,
//! grouping interdependent values together and documenting their
//! relationships. Constants that depend on each other are co-located to
//! prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! page_size (runtime, power of two in [MIN_PAGE_SIZE, MAX_PAGE_SIZE])
//!       │
//!       ├─> PAGE_HEADER_SIZE (16 bytes, fixed, every page)
//!       │
//!       ├─> max_record_size = page_size - PAGE_HEADER_SIZE - SLOT_SIZE
//!       │     │
//!       │     └─> max_entry_size = max_record_size - CHUNK_TRAILER_SIZE
//!       │
//!       ├─> normalization_interval = page_size / FSM_NORMALIZATION_DIVISOR
//!       │
//!       └─> bucket_capacity = (page_size - BUCKET_HEADER_SIZE) / BUCKET_ENTRY_SIZE
//!
//! CHUNK_TRAILER_SIZE (9) = first-record flag (1) + next chunk pointer (8)
//!       │
//!       └─> MIN_ENTRY_SIZE (== CHUNK_TRAILER_SIZE)
//!
//! METADATA_SIZE (13) = record type (1) + content length (4) + position (8)
//! ```
//!
//! Page-size dependent values are computed by the `*_for` helpers so every
//! component derives them the same way.
//!
//! ## Critical Invariants
//!
//! Enforced by compile-time assertions:
//!
//! 1. `MAX_PAGE_SIZE` fits a `u16` offset (slot offsets and free pointers)
//! 2. `MIN_PAGE_SIZE` leaves room for a chunk carrying the full metadata header
//! 3. An FSM page of `MIN_PAGE_SIZE` has at least one leaf

// ============================================================================
// PAGE SIZE
// ============================================================================

/// Default size of each page in bytes (16KB).
pub const DEFAULT_PAGE_SIZE: usize = 16384;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported page size. Page offsets are stored as `u16`.
pub const MAX_PAGE_SIZE: usize = 32768;

/// Size of the common page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

const _: () = assert!(
    MAX_PAGE_SIZE <= u16::MAX as usize + 1,
    "page offsets must fit in u16"
);

const _: () = assert!(DEFAULT_PAGE_SIZE.is_power_of_two());
const _: () = assert!(MIN_PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_PAGE_SIZE.is_power_of_two());

// ============================================================================
// DATA PAGE LAYOUT
// ============================================================================

/// Size of one slot directory entry: offset (2) + length (2) + version (8).
pub const SLOT_SIZE: usize = 12;

/// Trailer appended to every chunk: first-record flag (1) + next pointer (8).
pub const CHUNK_TRAILER_SIZE: usize = 1 + 8;

/// Smallest chunk worth writing; a page must offer more than this.
pub const MIN_ENTRY_SIZE: usize = CHUNK_TRAILER_SIZE;

/// Record metadata header: record type (1) + content length (4) + position (8).
pub const METADATA_SIZE: usize = 1 + 4 + 8;

/// Number of low bits of a chunk pointer holding the slot index.
pub const CHUNK_POINTER_SLOT_BITS: u32 = 16;

/// Version written to generated collection configurations.
pub const BINARY_VERSION: u32 = 3;

const _: () = assert!(
    MIN_PAGE_SIZE - PAGE_HEADER_SIZE - SLOT_SIZE > METADATA_SIZE + CHUNK_TRAILER_SIZE,
    "smallest page must fit a chunk holding the whole metadata header"
);

pub const fn max_record_size_for(page_size: usize) -> usize {
    page_size - PAGE_HEADER_SIZE - SLOT_SIZE
}

pub const fn max_entry_size_for(page_size: usize) -> usize {
    max_record_size_for(page_size) - CHUNK_TRAILER_SIZE
}

// ============================================================================
// FREE-SPACE MAP
// ============================================================================

/// Free space is normalized to a single byte: `bytes / (page_size / 256)`.
pub const FSM_NORMALIZATION_DIVISOR: usize = 256;

/// Largest normalized free-space value.
pub const FSM_MAX_NORMALIZED: u8 = u8::MAX;

/// Pages scanned between progress lines while rebuilding the free-space map.
pub const FSM_REBUILD_PROGRESS_INTERVAL: u32 = 1000;

pub const fn normalization_interval_for(page_size: usize) -> usize {
    page_size / FSM_NORMALIZATION_DIVISOR
}

const _: () = assert!(
    (MIN_PAGE_SIZE - PAGE_HEADER_SIZE) > (MIN_PAGE_SIZE / 2 - 1),
    "free-space map page must have at least one leaf"
);

// ============================================================================
// POSITION MAP
// ============================================================================

/// Bucket header: common page header (16) + entry count (4) + reserved (4).
pub const BUCKET_HEADER_SIZE: usize = PAGE_HEADER_SIZE + 8;

/// Bucket entry: status (1) + page index (4) + slot (2) + version (8).
pub const BUCKET_ENTRY_SIZE: usize = 1 + 4 + 2 + 8;

pub const fn bucket_capacity_for(page_size: usize) -> usize {
    (page_size - BUCKET_HEADER_SIZE) / BUCKET_ENTRY_SIZE
}

// ============================================================================
// FILE NAMING
// ============================================================================

/// Extension of the collection data file.
pub const DATA_FILE_EXTENSION: &str = "pcl";

/// Extension of the position map file.
pub const POSITION_MAP_FILE_EXTENSION: &str = "cpm";

/// Extension of the free-space map file.
pub const FREE_SPACE_MAP_FILE_EXTENSION: &str = "fsm";
