//! # Storage Module
//!
//! This module provides the paged-file layer underneath the record store:
//! files made of fixed-size pages, a manager that names and owns them, and
//! atomic operations that group page mutations into all-or-nothing units.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  Collection / PositionMap / FreeSpaceMap │
//! ├──────────────────────────────────────────┤
//! │  AtomicOperation (private write set)      │
//! ├──────────────────────────────────────────┤
//! │  FileManager (FileId -> AnyStorage)       │
//! ├─────────────────────┬────────────────────┤
//! │  MmapStorage        │  MemoryStorage     │
//! └─────────────────────┴────────────────────┘
//! ```
//!
//! Readers outside an operation's write set get slices straight into the
//! mapping (or heap buffer); writers get a private copy that is written back
//! on commit.
//!
//! ## Safety Model
//!
//! Memory-mapped files can become invalid when the file is grown and
//! remapped. The borrow checker enforces this at compile time:
//!
//! ```text
//! MmapStorage::page(&self) -> &[u8]     // Borrows &self immutably
//! MmapStorage::grow(&mut self)          // Requires &mut self exclusively
//! ```
//!
//! At the `FileManager` level each storage sits behind a `parking_lot::RwLock`
//! so the same rule holds across threads.
//!
//! ## Page Size
//!
//! The page size is chosen per `FileManager` (power of two, 1 KiB to 32 KiB,
//! default 16 KiB). Every page starts with the 16-byte `PageHeader`.
//!
//! ## Module Organization
//!
//! - `mmap`: memory-mapped paged file (`MmapStorage`)
//! - `memory`: heap-backed paged file (`MemoryStorage`)
//! - `driver`: `StorageDriver` trait and the `AnyStorage` wrapper
//! - `page`: page types and the common header
//! - `file_manager`: named files and `FileId`s
//! - `atomic`: atomic operations and their manager

mod atomic;
mod driver;
mod file_manager;
mod memory;
mod mmap;
mod page;

pub use atomic::{AtomicOperation, AtomicOperationsManager};
pub use driver::{AnyStorage, StorageDriver, StorageKind};
pub use file_manager::{FileId, FileManager};
pub use memory::MemoryStorage;
pub use mmap::MmapStorage;
pub use page::{validate_page, PageHeader, PageType};
