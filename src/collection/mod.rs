//! # Collection Module
//!
//! Record storage on top of the paged files of [`crate::storage`]. A
//! collection maps stable logical positions to records of any size, split
//! into chunks that fit on a page.
//!
//! ## Architecture Overview
//!
//! ```text
//!                  ┌──────────────────────────┐
//!                  │        Collection        │
//!                  └──┬──────────┬─────────┬──┘
//!                     │          │         │
//!          position → │          │         │ ← "page with N free bytes?"
//!       (page, slot)  │          │         │
//!   ┌─────────────────▼─┐  ┌─────▼─────┐  ┌▼────────────────┐
//!   │  PositionMap      │  │ data file │  │  FreeSpaceMap   │
//!   │  <name>.cpm       │  │ <name>.pcl│  │  <name>.fsm     │
//!   │  bucket pages     │  │ slotted   │  │  2-level max    │
//!   │                   │  │ pages     │  │  segment tree   │
//!   └───────────────────┘  └───────────┘  └─────────────────┘
//! ```
//!
//! Every mutation goes through an [`AtomicOperation`](crate::storage::AtomicOperation)
//! supplied by the caller. The three files are updated in the same operation
//! and become visible together on commit.
//!
//! ## Module Organization
//!
//! - `store`: the `Collection` and its read/write algorithms
//! - `chunk`: chunk trailer, record metadata header, backward serialization
//! - `data_page`: slotted data pages
//! - `state`: collection state page and position map entry point
//! - `position_map`: logical position index with neighbor queries
//! - `bucket`: position map bucket pages
//! - `free_space_map`: two-level free-space index
//! - `fsm_page`: max segment tree stored in one page
//! - `component`: file naming and lifecycle of the three component files
//! - `types`: values returned to callers

mod bucket;
mod chunk;
mod component;
mod data_page;
mod free_space_map;
mod fsm_page;
mod position_map;
mod state;
mod store;
mod types;

pub use bucket::{MapEntry, PositionEntry, PositionStatus};
pub use free_space_map::FreeSpaceMap;
pub use position_map::{PositionMap, PositionMapEntry};
pub use store::Collection;
pub use types::{BrowseEntry, BrowsePage, PhysicalPosition, RawRecord, RecordStatus};
