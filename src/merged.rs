//! Unified view over a stack of tables covering disjoint update-index
//! ranges.

use crate::config::HashId;
use crate::error::{Error, Result};
use crate::iterators::merge_iterator::MergeIterator;
use crate::iterators::{LogIterator, RefIterator};
use crate::record::{BlockType, LogRecord};
use crate::source::BlockSource;
use crate::table::{Table, TableIterator};

pub type MergedRefIterator<'a, S> = RefIterator<MergeIterator<TableIterator<'a, S>>>;
pub type MergedLogIterator<'a, S> = LogIterator<MergeIterator<TableIterator<'a, S>>>;

/// A stack of tables ordered oldest to newest, read as one sorted,
/// deduplicated ref database. Seeks fan out to every table and a merge
/// drains them with newest-wins shadowing.
#[derive(Debug)]
pub struct MergedTable<S: BlockSource> {
    stack: Vec<Table<S>>,
    suppress_deletions: bool,
    hash_id: HashId,
    min_update_index: u64,
    max_update_index: u64,
}

impl<S: BlockSource> MergedTable<S> {
    /// Validates that the tables share one hash function and cover
    /// ascending, disjoint update-index ranges. With `suppress_deletions`
    /// set, merged reads hide tombstones (lookup mode); without it they
    /// are surfaced (compaction mode).
    pub fn new(stack: Vec<Table<S>>, suppress_deletions: bool) -> Result<MergedTable<S>> {
        let hash_id = stack.first().map(|t| t.hash_id()).unwrap_or_default();
        let mut last_max = 0;
        for (i, table) in stack.iter().enumerate() {
            if table.hash_id() != hash_id {
                return Err(Error::Format("tables in a stack must share a hash id"));
            }
            if i > 0 && last_max >= table.min_update_index() {
                return Err(Error::Format("stack update-index ranges overlap"));
            }
            last_max = table.max_update_index();
        }
        Ok(MergedTable {
            min_update_index: stack.first().map(|t| t.min_update_index()).unwrap_or(0),
            max_update_index: last_max,
            stack,
            suppress_deletions,
            hash_id,
        })
    }

    pub fn hash_id(&self) -> HashId {
        self.hash_id
    }

    pub fn min_update_index(&self) -> u64 {
        self.min_update_index
    }

    pub fn max_update_index(&self) -> u64 {
        self.max_update_index
    }

    /// First ref with name ≥ `name` in the merged view, onwards.
    pub fn seek_ref(&self, name: &str) -> Result<MergedRefIterator<'_, S>> {
        Ok(RefIterator::new(self.seek(BlockType::Ref, name.as_bytes())?))
    }

    /// Merged reflog for `name`, newest entry first.
    pub fn seek_log(&self, name: &str) -> Result<MergedLogIterator<'_, S>> {
        self.seek_log_at(name, u64::MAX)
    }

    /// Merged reflog for `name` starting at the newest entry with update
    /// index ≤ `update_index`.
    pub fn seek_log_at(&self, name: &str, update_index: u64) -> Result<MergedLogIterator<'_, S>> {
        let key = LogRecord::key_for(name, update_index);
        Ok(LogIterator::new(self.seek(BlockType::Log, &key)?))
    }

    fn seek(&self, typ: BlockType, key: &[u8]) -> Result<MergeIterator<TableIterator<'_, S>>> {
        let iters = self
            .stack
            .iter()
            .map(|table| table.seek(typ, key))
            .collect::<Result<Vec<_>>>()?;
        MergeIterator::new(iters, self.suppress_deletions)
    }
}
