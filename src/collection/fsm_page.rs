//! # Free-Space Segment Tree Page
//!
//! One page of the free-space map holds a complete binary max-tree stored in
//! level order, one byte per node. Leaves are normalized free-space values of
//! individual data pages (second level) or maxima of whole page groups (first
//! level); every internal node caches the maximum of its two children.
//!
//! ## Shape
//!
//! ```text
//! levels          = log2(page_size)
//! internal nodes  = 2^(levels-1) - 1
//! leaves          = (page_size - PAGE_HEADER_SIZE) - internal nodes
//! node(level, i)  = PAGE_HEADER_SIZE + (2^(level-1) - 1) + i      level 1 = root
//! ```
//!
//! For a 16 KiB page that is 14 levels, 8191 internal nodes and 8177 leaves.
//! The leaf level is not full: a sibling past the last leaf counts as zero.
//!
//! ## Search Bias
//!
//! `find` descends left whenever the left child suffices, so it returns the
//! lowest-indexed qualifying leaf. Allocation therefore fills low pages first.

use eyre::{ensure, Result};

use crate::config::PAGE_HEADER_SIZE;
use crate::storage::{PageHeader, PageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentTree {
    page_size: usize,
    levels: u32,
    leaves: usize,
}

impl SegmentTree {
    pub fn new(page_size: usize) -> Self {
        let levels = page_size.trailing_zeros();
        let internal = (1usize << (levels - 1)) - 1;
        Self {
            page_size,
            levels,
            leaves: page_size - PAGE_HEADER_SIZE - internal,
        }
    }

    pub fn leaves(&self) -> usize {
        self.leaves
    }

    #[cfg(test)]
    pub fn levels(&self) -> u32 {
        self.levels
    }

    #[inline]
    fn offset(&self, level: u32, index: usize) -> usize {
        PAGE_HEADER_SIZE + (1usize << (level - 1)) - 1 + index
    }

    #[inline]
    fn value(&self, page: &[u8], level: u32, index: usize) -> u8 {
        if level == self.levels && index >= self.leaves {
            return 0;
        }
        page[self.offset(level, index)]
    }

    pub fn init(&self, page: &mut [u8]) -> Result<()> {
        page.fill(0);
        PageHeader::new(PageType::FreeSpaceMap, self.page_size).write_to(page)
    }

    pub fn max(&self, page: &[u8]) -> u8 {
        page[self.offset(1, 0)]
    }

    #[cfg(test)]
    pub fn leaf(&self, page: &[u8], index: usize) -> u8 {
        self.value(page, self.levels, index)
    }

    /// Index of the leftmost leaf holding at least `required`, if any.
    pub fn find(&self, page: &[u8], required: u8) -> Option<usize> {
        let root = self.max(page);
        if root == 0 || root < required {
            return None;
        }

        let mut index = 0usize;
        for level in 2..=self.levels {
            let left = index * 2;
            let right = left + 1;

            if level == self.levels && left >= self.leaves {
                return None;
            }

            if self.value(page, level, left) >= required {
                index = left;
            } else {
                if level == self.levels && right >= self.leaves {
                    return None;
                }
                index = right;
            }
        }

        Some(index)
    }

    /// Sets leaf `index` to `value` and propagates the maximum towards the
    /// root, stopping at the first node that already holds the new maximum.
    /// Returns the root value afterwards.
    pub fn update(&self, page: &mut [u8], index: usize, value: u8) -> Result<u8> {
        ensure!(
            index < self.leaves,
            "segment tree leaf {} out of range ({} leaves)",
            index,
            self.leaves
        );

        let leaf_offset = self.offset(self.levels, index);
        if page[leaf_offset] == value {
            return Ok(self.max(page));
        }
        page[leaf_offset] = value;

        let mut level = self.levels;
        let mut index = index;
        let mut current = value;
        while level > 1 {
            let sibling = self.value(page, level, index ^ 1);
            let parent = current.max(sibling);

            level -= 1;
            index /= 2;

            let offset = self.offset(level, index);
            if page[offset] == parent {
                break;
            }
            page[offset] = parent;
            current = parent;
        }

        Ok(self.max(page))
    }
}
