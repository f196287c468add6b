//! # Position Map
//!
//! Translates stable logical positions into the physical coordinates of a
//! record's entry-point chunk. Positions are handed out sequentially and are
//! never reused while their entry exists, even after removal.
//!
//! ## File Layout
//!
//! ```text
//! page 0        MapEntryPoint { bucket_file_size }
//! page 1        bucket 0   positions [0, CAPACITY)
//! page 2        bucket 1   positions [CAPACITY, 2 * CAPACITY)
//! ...
//! page N + 1    bucket N
//! ```
//!
//! `CAPACITY = (page_size - 24) / 15`, 1090 entries for 16 KiB pages. The
//! extent of the map is `bucket_file_size * CAPACITY`; lookups past it report
//! an absent entry while writes past it fail with `PositionOutOfRange`.
//!
//! ## Neighbor Queries
//!
//! `higher`, `ceiling`, `lower` and `floor` share one bucket-by-bucket scan
//! that skips everything except Filled entries. The scan keeps crossing
//! bucket boundaries until `limit` results are collected (`0` = no limit)
//! or the extent is exhausted. Results come back in ascending order; only
//! `lower_entries_reversed` keeps the descending order of a backward scan.
//!
//! ```text
//! filled {2, 5, 9, 20}, removed {12}
//!
//! higher(5, 10)  = [9, 20]
//! ceiling(9, 1)  = [9]
//! floor(12, 10)  = [2, 5, 9]
//! floor(12, 1)   = [9]
//! ```
//!
//! `for_each_entry` is the one walk that also reports Removed entries, with
//! their last version, for consistency checks over the whole map.

use eyre::{bail, ensure, Result};

use super::bucket::{Bucket, BucketMut, MapEntry, PositionEntry, PositionStatus};
use super::component::ComponentFile;
use super::state::MapEntryPoint;
use crate::config::{bucket_capacity_for, POSITION_MAP_FILE_EXTENSION};
use crate::error::CollectionError;
use crate::storage::{AtomicOperation, FileManager};

/// Filled position together with its coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionMapEntry {
    pub position: u64,
    pub entry: PositionEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone)]
pub struct PositionMap {
    file: ComponentFile,
    capacity: u64,
}

impl PositionMap {
    pub fn new(collection_name: &str, page_size: usize) -> Self {
        Self {
            file: ComponentFile::new(collection_name, POSITION_MAP_FILE_EXTENSION),
            capacity: bucket_capacity_for(page_size) as u64,
        }
    }

    pub fn file_name(&self) -> String {
        self.file.full_name()
    }

    /// Entries per bucket page.
    pub fn bucket_capacity(&self) -> u64 {
        self.capacity
    }

    pub fn exists(&self, op: &AtomicOperation) -> bool {
        self.file.exists(op)
    }

    pub fn create(&mut self, op: &mut AtomicOperation) -> Result<()> {
        let file = self.file.create(op)?;
        let entry_point = op.add_page(file)?;
        op.write_page(file, entry_point, |buf| {
            MapEntryPoint::init(buf)?;
            Ok(())
        })
    }

    pub fn open(&mut self, op: &AtomicOperation) -> Result<()> {
        self.file.open(op)?;
        Ok(())
    }

    pub fn delete(&mut self, op: &mut AtomicOperation) -> Result<()> {
        self.file.delete(op)
    }

    pub fn rename(&mut self, op: &mut AtomicOperation, new_collection_name: &str) -> Result<()> {
        self.file.rename(op, new_collection_name)
    }

    pub fn flush(&self, files: &FileManager) -> Result<()> {
        self.file.flush(files)
    }

    pub fn close(&mut self, files: &FileManager, flush: bool) -> Result<()> {
        self.file.close(files, flush)
    }

    fn locate(&self, position: u64) -> (u64, usize) {
        (position / self.capacity, (position % self.capacity) as usize)
    }

    fn bucket_page(bucket: u64) -> Result<u32> {
        match u32::try_from(bucket + 1) {
            Ok(page) => Ok(page),
            Err(_) => bail!("bucket {} exceeds position map file size", bucket),
        }
    }

    fn bucket_count(&self, op: &AtomicOperation) -> Result<u64> {
        let file = self.file.id()?;
        op.read_page(file, 0, |buf| {
            Ok(MapEntryPoint::from_bytes(buf)?.bucket_file_size())
        })
    }

    /// Number of positions addressable without adding a bucket.
    pub fn extent(&self, op: &AtomicOperation) -> Result<u64> {
        Ok(self.bucket_count(op)? * self.capacity)
    }

    /// Hands out the next position and marks it Allocated.
    pub fn allocate(&self, op: &mut AtomicOperation) -> Result<u64> {
        let file = self.file.id()?;
        let count = self.bucket_count(op)?;

        let reuse_last = if count == 0 {
            false
        } else {
            let last_page = Self::bucket_page(count - 1)?;
            !op.read_page(file, last_page, |buf| Bucket::from_page(buf)?.is_full())?
        };

        let bucket = if reuse_last {
            count - 1
        } else {
            let page = Self::bucket_page(count)?;
            if page >= op.filled_up_to(file)? {
                let added = op.add_page(file)?;
                ensure!(
                    added == page,
                    "position map file out of sync: added page {} for bucket page {}",
                    added,
                    page
                );
            }
            op.write_page(file, page, |buf| {
                BucketMut::init(buf)?;
                Ok(())
            })?;
            op.write_page(file, 0, |buf| {
                MapEntryPoint::from_bytes_mut(buf)?.set_bucket_file_size(count + 1);
                Ok(())
            })?;
            count
        };

        let page = Self::bucket_page(bucket)?;
        let index = op.write_page(file, page, |buf| BucketMut::from_page(buf)?.allocate())?;
        Ok(bucket * self.capacity + index as u64)
    }

    /// Allocates a position and fills it in one step.
    pub fn add(
        &self,
        op: &mut AtomicOperation,
        page_index: u32,
        slot: u16,
        version: u64,
    ) -> Result<u64> {
        let position = self.allocate(op)?;
        self.update(
            op,
            position,
            PositionEntry {
                page_index,
                slot,
                version,
            },
        )?;
        Ok(position)
    }

    fn writable_page(&self, op: &AtomicOperation, position: u64) -> Result<(u32, usize)> {
        let (bucket, index) = self.locate(position);
        let count = self.bucket_count(op)?;
        if bucket >= count {
            bail!(CollectionError::PositionOutOfRange {
                position,
                extent: count * self.capacity,
            });
        }

        let page = Self::bucket_page(bucket)?;
        let size = op.read_page(self.file.id()?, page, |buf| Bucket::from_page(buf)?.size())?;
        if index >= size {
            bail!(CollectionError::PositionOutOfRange {
                position,
                extent: bucket * self.capacity + size as u64,
            });
        }
        Ok((page, index))
    }

    pub fn update(&self, op: &mut AtomicOperation, position: u64, entry: PositionEntry) -> Result<()> {
        let (page, index) = self.writable_page(op, position)?;
        op.write_page(self.file.id()?, page, |buf| {
            BucketMut::from_page(buf)?.set(index, entry)
        })
    }

    pub fn update_version(&self, op: &mut AtomicOperation, position: u64, version: u64) -> Result<()> {
        let (page, index) = self.writable_page(op, position)?;
        op.write_page(self.file.id()?, page, |buf| {
            BucketMut::from_page(buf)?.set_version(index, version)
        })
    }

    /// Turns the entry into a tombstone. Coordinates and version are kept.
    pub fn remove(&self, op: &mut AtomicOperation, position: u64) -> Result<()> {
        let (page, index) = self.writable_page(op, position)?;
        op.write_page(self.file.id()?, page, |buf| {
            BucketMut::from_page(buf)?.remove(index)
        })
    }

    pub fn get(&self, op: &AtomicOperation, position: u64) -> Result<Option<MapEntry>> {
        let (bucket, index) = self.locate(position);
        if bucket >= self.bucket_count(op)? {
            return Ok(None);
        }

        let page = Self::bucket_page(bucket)?;
        op.read_page(self.file.id()?, page, |buf| Bucket::from_page(buf)?.get(index))
    }

    pub fn get_filled(&self, op: &AtomicOperation, position: u64) -> Result<Option<PositionEntry>> {
        Ok(self.get(op, position)?.and_then(|entry| entry.filled()))
    }

    pub fn get_status(&self, op: &AtomicOperation, position: u64) -> Result<PositionStatus> {
        let (bucket, index) = self.locate(position);
        if bucket >= self.bucket_count(op)? {
            return Ok(PositionStatus::NotExistent);
        }

        let page = Self::bucket_page(bucket)?;
        op.read_page(self.file.id()?, page, |buf| Bucket::from_page(buf)?.status(index))
    }

    pub fn get_version(&self, op: &AtomicOperation, position: u64) -> Result<Option<u64>> {
        Ok(self.get_filled(op, position)?.map(|entry| entry.version))
    }

    /// Position the next `allocate` will hand out.
    pub fn next_position(&self, op: &AtomicOperation) -> Result<u64> {
        let count = self.bucket_count(op)?;
        if count == 0 {
            return Ok(0);
        }

        let page = Self::bucket_page(count - 1)?;
        let size = op.read_page(self.file.id()?, page, |buf| Bucket::from_page(buf)?.size())?;
        Ok((count - 1) * self.capacity + size as u64)
    }

    pub fn first_position(&self, op: &AtomicOperation) -> Result<Option<u64>> {
        Ok(self
            .scan(op, 0, Direction::Forward, 1, |position, _| position)?
            .first()
            .copied())
    }

    pub fn last_position(&self, op: &AtomicOperation) -> Result<Option<u64>> {
        Ok(self
            .scan(op, u64::MAX, Direction::Backward, 1, |position, _| position)?
            .first()
            .copied())
    }

    /// Calls `visit(position, status, version)` for every Filled and Removed
    /// entry in ascending order. Allocated entries are skipped.
    pub fn for_each_entry(
        &self,
        op: &AtomicOperation,
        mut visit: impl FnMut(u64, PositionStatus, u64) -> Result<()>,
    ) -> Result<()> {
        let file = self.file.id()?;
        for bucket in 0..self.bucket_count(op)? {
            let base = bucket * self.capacity;
            op.read_page(file, Self::bucket_page(bucket)?, |buf| {
                let view = Bucket::from_page(buf)?;
                for i in 0..view.size()? {
                    match view.get(i)? {
                        Some(MapEntry::Filled(entry)) => {
                            visit(base + i as u64, PositionStatus::Filled, entry.version)?
                        }
                        Some(MapEntry::Removed(entry)) => {
                            visit(base + i as u64, PositionStatus::Removed, entry.version)?
                        }
                        Some(MapEntry::Allocated) | None => {}
                    }
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Walks Filled entries from `from` (inclusive) in `direction`, building
    /// one result per entry until `limit` results exist.
    fn scan<T>(
        &self,
        op: &AtomicOperation,
        from: u64,
        direction: Direction,
        limit: usize,
        mut build: impl FnMut(u64, PositionEntry) -> T,
    ) -> Result<Vec<T>> {
        let file = self.file.id()?;
        let count = self.bucket_count(op)?;
        let limit = if limit == 0 { usize::MAX } else { limit };
        let mut results = Vec::new();

        if count == 0 {
            return Ok(results);
        }

        let (mut bucket, mut index) = self.locate(from);
        if bucket >= count {
            if direction == Direction::Forward {
                return Ok(results);
            }
            bucket = count - 1;
            index = usize::MAX;
        }

        loop {
            let page = Self::bucket_page(bucket)?;
            let base = bucket * self.capacity;

            op.read_page(file, page, |buf| {
                let view = Bucket::from_page(buf)?;
                let size = view.size()?;

                let mut visit = |i: usize| -> Result<bool> {
                    if let Some(MapEntry::Filled(entry)) = view.get(i)? {
                        results.push(build(base + i as u64, entry));
                    }
                    Ok(results.len() >= limit)
                };

                match direction {
                    Direction::Forward => {
                        for i in index..size {
                            if visit(i)? {
                                break;
                            }
                        }
                    }
                    Direction::Backward => {
                        if size > 0 {
                            for i in (0..=index.min(size - 1)).rev() {
                                if visit(i)? {
                                    break;
                                }
                            }
                        }
                    }
                }
                Ok(())
            })?;

            if results.len() >= limit {
                break;
            }

            match direction {
                Direction::Forward => {
                    bucket += 1;
                    index = 0;
                    if bucket >= count {
                        break;
                    }
                }
                Direction::Backward => {
                    if bucket == 0 {
                        break;
                    }
                    bucket -= 1;
                    index = usize::MAX;
                }
            }
        }

        Ok(results)
    }

    fn ascending<T>(mut items: Vec<T>) -> Vec<T> {
        items.reverse();
        items
    }

    pub fn ceiling(&self, op: &AtomicOperation, position: u64, limit: usize) -> Result<Vec<u64>> {
        self.scan(op, position, Direction::Forward, limit, |p, _| p)
    }

    pub fn higher(&self, op: &AtomicOperation, position: u64, limit: usize) -> Result<Vec<u64>> {
        match position.checked_add(1) {
            Some(next) => self.ceiling(op, next, limit),
            None => Ok(Vec::new()),
        }
    }

    pub fn floor(&self, op: &AtomicOperation, position: u64, limit: usize) -> Result<Vec<u64>> {
        self.scan(op, position, Direction::Backward, limit, |p, _| p)
            .map(Self::ascending)
    }

    pub fn lower(&self, op: &AtomicOperation, position: u64, limit: usize) -> Result<Vec<u64>> {
        match position.checked_sub(1) {
            Some(previous) => self.floor(op, previous, limit),
            None => Ok(Vec::new()),
        }
    }

    pub fn ceiling_entries(
        &self,
        op: &AtomicOperation,
        position: u64,
        limit: usize,
    ) -> Result<Vec<PositionMapEntry>> {
        self.scan(op, position, Direction::Forward, limit, |position, entry| {
            PositionMapEntry { position, entry }
        })
    }

    pub fn higher_entries(
        &self,
        op: &AtomicOperation,
        position: u64,
        limit: usize,
    ) -> Result<Vec<PositionMapEntry>> {
        match position.checked_add(1) {
            Some(next) => self.ceiling_entries(op, next, limit),
            None => Ok(Vec::new()),
        }
    }

    pub fn floor_entries(
        &self,
        op: &AtomicOperation,
        position: u64,
        limit: usize,
    ) -> Result<Vec<PositionMapEntry>> {
        self.floor_entries_reversed(op, position, limit)
            .map(Self::ascending)
    }

    pub fn lower_entries(
        &self,
        op: &AtomicOperation,
        position: u64,
        limit: usize,
    ) -> Result<Vec<PositionMapEntry>> {
        self.lower_entries_reversed(op, position, limit)
            .map(Self::ascending)
    }

    fn floor_entries_reversed(
        &self,
        op: &AtomicOperation,
        position: u64,
        limit: usize,
    ) -> Result<Vec<PositionMapEntry>> {
        self.scan(op, position, Direction::Backward, limit, |position, entry| {
            PositionMapEntry { position, entry }
        })
    }

    /// Entries strictly below `position`, nearest first.
    pub fn lower_entries_reversed(
        &self,
        op: &AtomicOperation,
        position: u64,
        limit: usize,
    ) -> Result<Vec<PositionMapEntry>> {
        match position.checked_sub(1) {
            Some(previous) => self.floor_entries_reversed(op, previous, limit),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::AtomicOperationsManager;
    use std::sync::Arc;

    const PAGE: usize = 1024;

    fn setup() -> (AtomicOperationsManager, PositionMap) {
        let atomic = AtomicOperationsManager::new(Arc::new(FileManager::in_memory(PAGE)));
        let mut map = PositionMap::new("users", PAGE);
        atomic.execute(|op| map.create(op)).unwrap();
        (atomic, map)
    }

    fn coords(page_index: u32) -> PositionEntry {
        PositionEntry {
            page_index,
            slot: 0,
            version: 1,
        }
    }

    /// Filled {2, 5, 9, 20}, removed {12}, everything else allocated.
    fn neighbors_fixture() -> (AtomicOperationsManager, PositionMap) {
        let (atomic, map) = setup();
        atomic
            .execute(|op| {
                for position in 0..=20u64 {
                    assert_eq!(map.allocate(op)?, position);
                }
                for position in [2u64, 5, 9, 12, 20] {
                    map.update(op, position, coords(position as u32))?;
                }
                map.remove(op, 12)
            })
            .unwrap();
        (atomic, map)
    }

    #[test]
    fn empty_map_has_nothing() {
        let (atomic, map) = setup();
        atomic
            .read(|op| {
                assert_eq!(map.get(op, 0)?, None);
                assert_eq!(map.get_status(op, 0)?, PositionStatus::NotExistent);
                assert_eq!(map.first_position(op)?, None);
                assert_eq!(map.last_position(op)?, None);
                assert_eq!(map.next_position(op)?, 0);
                assert!(map.ceiling(op, 0, 0)?.is_empty());
                assert!(map.floor(op, 100, 0)?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn add_fills_sequential_positions() {
        let (atomic, map) = setup();

        let positions = atomic
            .execute(|op| Ok((map.add(op, 1, 0, 7)?, map.add(op, 1, 1, 8)?)))
            .unwrap();
        assert_eq!(positions, (0, 1));

        atomic
            .read(|op| {
                assert_eq!(
                    map.get(op, 1)?,
                    Some(MapEntry::Filled(PositionEntry {
                        page_index: 1,
                        slot: 1,
                        version: 8
                    }))
                );
                assert_eq!(map.get_version(op, 0)?, Some(7));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn allocation_crosses_bucket_boundary() {
        let (atomic, map) = setup();
        let capacity = map.bucket_capacity();

        let last = atomic
            .execute(|op| {
                let mut last = 0;
                for _ in 0..=capacity {
                    last = map.allocate(op)?;
                }
                Ok(last)
            })
            .unwrap();

        assert_eq!(last, capacity);
        let extent = atomic.read(|op| map.extent(op)).unwrap();
        assert_eq!(extent, capacity * 2);
        assert_eq!(atomic.read(|op| map.next_position(op)).unwrap(), capacity + 1);
    }

    #[test]
    fn remove_keeps_coordinates() {
        let (atomic, map) = setup();
        let position = atomic.execute(|op| map.add(op, 4, 2, 9)).unwrap();
        atomic.execute(|op| map.remove(op, position)).unwrap();

        atomic
            .read(|op| {
                assert_eq!(
                    map.get(op, position)?,
                    Some(MapEntry::Removed(PositionEntry {
                        page_index: 4,
                        slot: 2,
                        version: 9
                    }))
                );
                assert_eq!(map.get_filled(op, position)?, None);
                assert_eq!(map.get_version(op, position)?, None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn update_outside_extent_fails() {
        let (atomic, map) = setup();
        atomic.execute(|op| map.allocate(op)).unwrap();

        for position in [1u64, 10_000] {
            let err = atomic
                .execute(|op| map.update(op, position, coords(1)))
                .unwrap_err();
            assert!(matches!(
                err.downcast_ref::<CollectionError>(),
                Some(CollectionError::PositionOutOfRange { .. })
            ));

            let err = atomic
                .execute(|op| map.update_version(op, position, 3))
                .unwrap_err();
            assert!(matches!(
                err.downcast_ref::<CollectionError>(),
                Some(CollectionError::PositionOutOfRange { .. })
            ));
        }
    }

    #[test]
    fn neighbor_queries_skip_non_filled() {
        let (atomic, map) = neighbors_fixture();
        atomic
            .read(|op| {
                assert_eq!(map.higher(op, 5, 10)?, vec![9, 20]);
                assert_eq!(map.ceiling(op, 9, 1)?, vec![9]);
                assert_eq!(map.ceiling(op, 10, 0)?, vec![20]);
                assert_eq!(map.floor(op, 12, 10)?, vec![2, 5, 9]);
                assert_eq!(map.floor(op, 12, 1)?, vec![9]);
                assert_eq!(map.lower(op, 9, 0)?, vec![2, 5]);
                assert_eq!(map.lower(op, 2, 0)?, Vec::<u64>::new());
                assert_eq!(map.first_position(op)?, Some(2));
                assert_eq!(map.last_position(op)?, Some(20));
                assert_eq!(map.get_status(op, 12)?, PositionStatus::Removed);
                assert_eq!(map.get_status(op, 3)?, PositionStatus::Allocated);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn for_each_entry_reports_filled_and_removed() {
        let (atomic, map) = neighbors_fixture();
        atomic
            .execute(|op| map.update_version(op, 20, 7))
            .unwrap();

        let mut seen = Vec::new();
        atomic
            .read(|op| {
                map.for_each_entry(op, |position, status, version| {
                    seen.push((position, status, version));
                    Ok(())
                })
            })
            .unwrap();

        assert_eq!(
            seen,
            vec![
                (2, PositionStatus::Filled, 1),
                (5, PositionStatus::Filled, 1),
                (9, PositionStatus::Filled, 1),
                (12, PositionStatus::Removed, 1),
                (20, PositionStatus::Filled, 7),
            ]
        );
    }

    #[test]
    fn for_each_entry_stops_on_visitor_error() {
        let (atomic, map) = neighbors_fixture();
        let mut calls = 0;
        let result = atomic.read(|op| {
            map.for_each_entry(op, |position, _, _| {
                calls += 1;
                ensure!(position < 5, "stop at {}", position);
                Ok(())
            })
        });

        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn neighbor_query_edges() {
        let (atomic, map) = neighbors_fixture();
        atomic
            .read(|op| {
                assert!(map.higher(op, u64::MAX, 0)?.is_empty());
                assert!(map.lower(op, 0, 0)?.is_empty());
                assert!(map.ceiling(op, 1_000_000, 0)?.is_empty());
                assert_eq!(map.floor(op, 1_000_000, 2)?, vec![9, 20]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn entry_variants_carry_coordinates() {
        let (atomic, map) = neighbors_fixture();
        atomic
            .read(|op| {
                let higher = map.higher_entries(op, 2, 2)?;
                assert_eq!(
                    higher,
                    vec![
                        PositionMapEntry { position: 5, entry: coords(5) },
                        PositionMapEntry { position: 9, entry: coords(9) },
                    ]
                );

                let reversed: Vec<u64> = map
                    .lower_entries_reversed(op, 20, 0)?
                    .iter()
                    .map(|e| e.position)
                    .collect();
                assert_eq!(reversed, vec![9, 5, 2]);

                let lower: Vec<u64> = map
                    .lower_entries(op, 20, 0)?
                    .iter()
                    .map(|e| e.position)
                    .collect();
                assert_eq!(lower, vec![2, 5, 9]);

                let floor: Vec<u64> = map
                    .floor_entries(op, 20, 2)?
                    .iter()
                    .map(|e| e.position)
                    .collect();
                assert_eq!(floor, vec![9, 20]);
                assert!(map.ceiling_entries(op, 21, 0)?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn queries_span_buckets() {
        let (atomic, map) = setup();
        let capacity = map.bucket_capacity();

        atomic
            .execute(|op| {
                for _ in 0..capacity * 2 {
                    map.allocate(op)?;
                }
                map.update(op, 1, coords(1))?;
                map.update(op, capacity * 2 - 1, coords(2))
            })
            .unwrap();

        atomic
            .read(|op| {
                assert_eq!(map.higher(op, 1, 0)?, vec![capacity * 2 - 1]);
                assert_eq!(map.lower(op, capacity * 2 - 1, 0)?, vec![1]);
                assert_eq!(map.floor(op, u64::MAX, 0)?, vec![1, capacity * 2 - 1]);
                Ok(())
            })
            .unwrap();
    }
}
