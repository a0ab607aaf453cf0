use std::cmp::{self, Reverse};
use std::collections::BinaryHeap;

use crate::error::Result;
use crate::record::Record;

use super::RecordIterator;

/// Heap entry owning its record and the derived key. Sub-iterator index 0
/// is the oldest table in the stack.
struct HeapEntry {
    key: Vec<u8>,
    rec: Record,
    index: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == cmp::Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// `BinaryHeap` pops the greatest entry, so order by reversed key; on
    /// equal keys the higher stack index (the newer table) pops first.
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        Reverse(&self.key)
            .cmp(&Reverse(&other.key))
            .then_with(|| self.index.cmp(&other.index))
    }
}

/// K-way merge over one record kind across a stack of tables ordered
/// oldest to newest. For every key only the newest table's record
/// survives; older duplicates are drained and dropped. With
/// `suppress_deletions` set, surviving tombstones are hidden too.
pub struct MergeIterator<I: RecordIterator> {
    iters: Vec<I>,
    heap: BinaryHeap<HeapEntry>,
    suppress_deletions: bool,
}

impl<I: RecordIterator> MergeIterator<I> {
    pub fn new(iters: Vec<I>, suppress_deletions: bool) -> Result<MergeIterator<I>> {
        let mut merge = MergeIterator {
            heap: BinaryHeap::with_capacity(iters.len()),
            iters,
            suppress_deletions,
        };
        for i in 0..merge.iters.len() {
            merge.advance(i)?;
        }
        Ok(merge)
    }

    /// Pulls the next record from sub-iterator `index` into the heap;
    /// exhausted iterators simply contribute nothing.
    fn advance(&mut self, index: usize) -> Result<()> {
        if let Some(rec) = self.iters[index].next_record()? {
            self.heap.push(HeapEntry {
                key: rec.key(),
                rec,
                index,
            });
        }
        Ok(())
    }

    fn next_entry(&mut self) -> Result<Option<Record>> {
        let Some(entry) = self.heap.pop() else {
            return Ok(None);
        };
        self.advance(entry.index)?;

        // Drain records shadowed by the winner. Ties popped in
        // newest-first order, so anything still at the top with the same
        // key came from an older table.
        while let Some(top) = self.heap.peek() {
            if top.key > entry.key {
                break;
            }
            let shadowed = self.heap.pop().expect("peeked entry exists");
            self.advance(shadowed.index)?;
        }
        Ok(Some(entry.rec))
    }
}

impl<I: RecordIterator> RecordIterator for MergeIterator<I> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            match self.next_entry()? {
                Some(rec) if self.suppress_deletions && rec.is_deletion() => continue,
                other => return Ok(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RefRecord, RefValue};

    struct VecIterator {
        recs: std::vec::IntoIter<Record>,
    }

    impl RecordIterator for VecIterator {
        fn next_record(&mut self) -> Result<Option<Record>> {
            Ok(self.recs.next())
        }
    }

    fn refs(entries: &[(&str, u64, Option<u8>)]) -> VecIterator {
        let recs: Vec<Record> = entries
            .iter()
            .map(|(name, idx, val)| {
                Record::Ref(RefRecord {
                    ref_name: (*name).into(),
                    update_index: *idx,
                    value: match val {
                        Some(b) => RefValue::Direct(vec![*b; 20]),
                        None => RefValue::Deletion,
                    },
                })
            })
            .collect();
        VecIterator {
            recs: recs.into_iter(),
        }
    }

    fn drain(mut it: MergeIterator<VecIterator>) -> Vec<(String, u64)> {
        let mut out = Vec::new();
        while let Some(rec) = it.next_record().unwrap() {
            let Record::Ref(r) = rec else { unreachable!() };
            out.push((r.ref_name, r.update_index));
        }
        out
    }

    #[test]
    fn newest_table_shadows_older() {
        let old = refs(&[("refs/heads/a", 1, Some(1)), ("refs/heads/b", 1, Some(1))]);
        let new = refs(&[("refs/heads/a", 2, Some(2))]);
        let merged = MergeIterator::new(vec![old, new], false).unwrap();
        assert_eq!(
            drain(merged),
            vec![("refs/heads/a".to_string(), 2), ("refs/heads/b".to_string(), 1)]
        );
    }

    #[test]
    fn tombstones_can_be_suppressed() {
        let old = refs(&[("refs/heads/a", 1, Some(1))]);
        let new = refs(&[("refs/heads/a", 2, None)]);
        let merged = MergeIterator::new(vec![old, new], true).unwrap();
        assert!(drain(merged).is_empty());

        let old = refs(&[("refs/heads/a", 1, Some(1))]);
        let new = refs(&[("refs/heads/a", 2, None)]);
        let merged = MergeIterator::new(vec![old, new], false).unwrap();
        assert_eq!(drain(merged), vec![("refs/heads/a".to_string(), 2)]);
    }

    #[test]
    fn output_is_sorted_across_inputs() {
        let a = refs(&[("refs/heads/c", 1, Some(1)), ("refs/heads/x", 1, Some(1))]);
        let b = refs(&[("refs/heads/a", 2, Some(2)), ("refs/heads/m", 2, Some(2))]);
        let merged = MergeIterator::new(vec![a, b], false).unwrap();
        let names: Vec<String> = drain(merged).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["refs/heads/a", "refs/heads/c", "refs/heads/m", "refs/heads/x"]);
    }
}
