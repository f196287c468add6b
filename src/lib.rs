//! # pagestore - Page-Level Record Store
//!
//! pagestore keeps variable-length records in fixed-size pages and addresses
//! them by stable logical positions. A record larger than a page is split
//! into a chain of chunks spread over several pages.
//!
//! - **Stable positions**: a position never changes while the record lives,
//!   no matter how often the record moves between pages
//! - **Free-space lookup in two page reads**: a two-level max segment tree
//!   finds the leftmost page with enough room
//! - **All-or-nothing mutations**: every page write goes through an atomic
//!   operation that commits or rolls back as a unit
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use pagestore::{AtomicOperationsManager, Collection, CollectionConfig, FileManager};
//!
//! let files = Arc::new(FileManager::open("./data", 16384)?);
//! let atomic = AtomicOperationsManager::new(Arc::clone(&files));
//! let collection = Collection::new(CollectionConfig::new(1, "users"), files)?;
//!
//! atomic.execute(|op| collection.create(op))?;
//! let created = atomic.execute(|op| collection.create_record(op, b"alice", 1, 0x0D, None))?;
//! let record = atomic.read(|op| collection.read_record(op, created.position))?;
//! assert_eq!(record.content, b"alice");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 Collection                   │
//! ├───────────────┬───────────────┬─────────────┤
//! │  PositionMap  │  data pages   │ FreeSpaceMap│
//! ├───────────────┴───────────────┴─────────────┤
//! │     AtomicOperation (write set, commit)      │
//! ├─────────────────────────────────────────────┤
//! │        FileManager (named paged files)       │
//! ├──────────────────────┬──────────────────────┤
//! │     MmapStorage      │    MemoryStorage     │
//! └──────────────────────┴──────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! Each collection owns three files in the store directory:
//!
//! ```text
//! store_dir/
//! ├── users.pcl   # state page + slotted data pages
//! ├── users.cpm   # position map: entry point + bucket pages
//! └── users.fsm   # free-space map: first-level + second-level tree pages
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: paged files, file manager, atomic operations
//! - [`collection`]: collection, position map, free-space map
//! - [`config`]: layout constants and collection configuration
//! - [`error`]: typed errors carried inside `eyre` reports

#[macro_use]
mod macros;

pub mod collection;
pub mod config;
pub mod error;
pub mod storage;

pub use collection::{
    BrowseEntry, BrowsePage, Collection, FreeSpaceMap, MapEntry, PhysicalPosition, PositionEntry,
    PositionMap, PositionMapEntry, PositionStatus, RawRecord, RecordStatus,
};
pub use config::{CollectionConfig, RecordConflictStrategy};
pub use error::CollectionError;
pub use storage::{AtomicOperation, AtomicOperationsManager, FileId, FileManager};
