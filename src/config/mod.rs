//! # Collection Configuration
//!
//! This module centralizes the configuration of the record store. Layout
//! constants live in [`constants`] with their dependencies documented and
//! enforced through compile-time assertions; runtime options of a single
//! collection live in [`CollectionConfig`].
//!
//! ## Configuration Options
//!
//! | Option            | Default          | Description                               |
//! |-------------------|------------------|-------------------------------------------|
//! | page_size         | 16384            | Page size of all three collection files   |
//! | browse_batch_size | 0 (one bucket)   | Positions fetched per `next_page` call    |
//! | conflict_strategy | version          | Strategy name handed to upper layers      |
//!
//! ## Usage
//!
//! ```ignore
//! let config = CollectionConfig::new(7, "users")
//!     .page_size(2048)
//!     .browse_batch_size(64)
//!     .conflict_strategy(RecordConflictStrategy::Content);
//! config.validate()?;
//! ```

pub mod constants;
pub use constants::*;

use std::fmt;
use std::str::FromStr;

use eyre::{ensure, Result};

use crate::error::CollectionError;

/// How concurrent modifications of the same record are resolved by the
/// layers above the record store. The store only keeps and reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordConflictStrategy {
    #[default]
    Version,
    Content,
    AutoMerge,
}

impl RecordConflictStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            RecordConflictStrategy::Version => "version",
            RecordConflictStrategy::Content => "content",
            RecordConflictStrategy::AutoMerge => "automerge",
        }
    }
}

impl fmt::Display for RecordConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RecordConflictStrategy {
    type Err = CollectionError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "version" => Ok(RecordConflictStrategy::Version),
            "content" => Ok(RecordConflictStrategy::Content),
            "automerge" => Ok(RecordConflictStrategy::AutoMerge),
            _ => Err(CollectionError::UnknownConflictStrategy { name: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionConfig {
    id: u32,
    name: String,
    page_size: usize,
    browse_batch_size: usize,
    conflict_strategy: RecordConflictStrategy,
    binary_version: u32,
}

impl CollectionConfig {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            page_size: DEFAULT_PAGE_SIZE,
            browse_batch_size: 0,
            conflict_strategy: RecordConflictStrategy::default(),
            binary_version: BINARY_VERSION,
        }
    }

    /// Sets the page size shared by the data, position map and free-space
    /// map files. Must be a power of two between 1 KiB and 32 KiB.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets how many positions `next_page` resolves per call. Zero means one
    /// position-map bucket worth of positions.
    pub fn browse_batch_size(mut self, count: usize) -> Self {
        self.browse_batch_size = count;
        self
    }

    pub fn conflict_strategy(mut self, strategy: RecordConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.page_size.is_power_of_two(),
            "page size {} is not a power of two",
            self.page_size
        );
        ensure!(
            (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size),
            "page size {} outside of supported range [{}, {}]",
            self.page_size,
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE
        );
        Ok(())
    }

    pub fn get_id(&self) -> u32 {
        self.id
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_page_size(&self) -> usize {
        self.page_size
    }

    pub fn get_conflict_strategy(&self) -> RecordConflictStrategy {
        self.conflict_strategy
    }

    pub fn get_binary_version(&self) -> u32 {
        self.binary_version
    }

    /// Number of positions resolved per browse call.
    pub fn effective_browse_batch_size(&self) -> usize {
        if self.browse_batch_size == 0 {
            bucket_capacity_for(self.page_size)
        } else {
            self.browse_batch_size
        }
    }

    pub(crate) fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub(crate) fn set_conflict_strategy(&mut self, strategy: RecordConflictStrategy) {
        self.conflict_strategy = strategy;
    }
}
