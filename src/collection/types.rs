//! Value types returned by [`Collection`](super::Collection) operations.

/// Logical position of a record together with what the index knows about it.
/// `version` is `None` for positions that were only allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalPosition {
    pub position: u64,
    pub record_type: u8,
    pub version: Option<u64>,
}

/// Record content as stored, with the version and type it was written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub content: Vec<u8>,
    pub version: u64,
    pub record_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    NotExistent,
    Allocated,
    Present,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseEntry {
    pub position: u64,
    pub record: RawRecord,
}

/// One batch of a collection scan. Pass `cursor` to the next
/// [`next_page`](super::Collection::next_page) call to continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowsePage {
    pub entries: Vec<BrowseEntry>,
    pub cursor: u64,
}

impl BrowsePage {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn positions(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|entry| entry.position)
    }
}
