use crate::block::BlockIterator;
use crate::error::{Error, Result};
use crate::iterators::RecordIterator;
use crate::record::{BlockType, Record, RefRecord, RefValue};
use crate::source::BlockSource;

use super::Table;

/// Walks one section of a table block by block. Holds the table by
/// reference, so the borrow checker guarantees the table outlives it; the
/// current block's buffer is released whenever the iterator moves on or is
/// dropped.
pub struct TableIterator<'a, S: BlockSource> {
    table: &'a Table<S>,
    typ: BlockType,
    block_off: u64,
    bi: Option<BlockIterator>,
    finished: bool,
}

impl<'a, S: BlockSource> TableIterator<'a, S> {
    pub(crate) fn empty(table: &'a Table<S>, typ: BlockType) -> Self {
        Self {
            table,
            typ,
            block_off: 0,
            bi: None,
            finished: true,
        }
    }

    /// Opens the block at `off`. `want` of `None` accepts any block type
    /// (used while descending an index); otherwise a different type means
    /// the section ended and `None` is returned.
    fn at(table: &'a Table<S>, off: u64, want: Option<BlockType>) -> Result<Option<Self>> {
        let Some(br) = table.block_reader_at(off, want)? else {
            return Ok(None);
        };
        Ok(Some(Self {
            table,
            typ: br.block_type(),
            block_off: off,
            bi: Some(br.into_iter()),
            finished: false,
        }))
    }

    /// Positions at the first block of the section, or of its index.
    fn start(table: &'a Table<S>, typ: BlockType, index: bool) -> Result<Option<Self>> {
        let offs = table.offsets_for(typ);
        let (off, want) = if index {
            if offs.index_offset == 0 {
                return Ok(None);
            }
            (offs.index_offset, BlockType::Index)
        } else {
            (offs.offset, typ)
        };
        Self::at(table, off, Some(want))
    }

    /// Seeks `want` in the `typ` section, choosing the indexed descent when
    /// the section has an index and the linear block walk otherwise.
    pub(crate) fn seek(table: &'a Table<S>, typ: BlockType, want: &[u8]) -> Result<Self> {
        if table.offsets_for(typ).index_offset > 0 {
            return Self::seek_indexed(table, typ, want);
        }
        let Some(mut ti) = Self::start(table, typ, false)? else {
            return Ok(Self::empty(table, typ));
        };
        ti.seek_linear(want)?;
        Ok(ti)
    }

    /// Advances block by block while the next block's first key is still ≤
    /// `want`, then finishes with an in-block seek. Rejected candidate
    /// blocks are dropped (returned) as soon as their first key is read.
    fn seek_linear(&mut self, want: &[u8]) -> Result<()> {
        loop {
            let Some(bi) = self.bi.as_ref() else {
                return Ok(());
            };
            let next_off = self.block_off + bi.reader().full_block_size() as u64;
            let Some(next_br) = self.table.block_reader_at(next_off, Some(self.typ))? else {
                break;
            };
            if next_br.first_key()?.as_slice() > want {
                break;
            }
            self.block_off = next_off;
            self.bi = Some(next_br.into_iter());
        }
        if let Some(bi) = self.bi.as_mut() {
            bi.seek(want)?;
        }
        Ok(())
    }

    /// Seeks the topmost index level linearly, then follows child offsets
    /// down until a data block is reached. Index blocks may nest to any
    /// depth.
    fn seek_indexed(table: &'a Table<S>, typ: BlockType, want: &[u8]) -> Result<Self> {
        let Some(mut index_iter) = Self::start(table, typ, true)? else {
            return Err(Error::Format("recorded index offset has no index block"));
        };
        index_iter.seek_linear(want)?;
        loop {
            match index_iter.next_record()? {
                // No index entry with last_key ≥ want: no record can match.
                None => return Ok(Self::empty(table, typ)),
                Some(Record::Index(idx)) => {
                    let Some(mut next) = Self::at(table, idx.offset, None)? else {
                        return Err(Error::Format("index child offset out of range"));
                    };
                    next.bi
                        .as_mut()
                        .expect("freshly opened block has an iterator")
                        .seek(want)?;
                    if next.typ == typ {
                        return Ok(next);
                    }
                    if next.typ != BlockType::Index {
                        return Err(Error::Format("index child has mismatched type"));
                    }
                    index_iter = next;
                }
                Some(_) => return Err(Error::Format("index section yielded a foreign record")),
            }
        }
    }
}

impl<S: BlockSource> RecordIterator for TableIterator<'_, S> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            let Some(bi) = self.bi.as_mut() else {
                self.finished = true;
                return Ok(None);
            };
            if let Some(mut rec) = bi.next_record()? {
                // Ref update indices are stored as deltas against the
                // table's minimum.
                if let Record::Ref(r) = &mut rec {
                    r.update_index += self.table.min_update_index();
                }
                return Ok(Some(rec));
            }
            let next_off = self.block_off + bi.reader().full_block_size() as u64;
            match Self::at(self.table, next_off, Some(self.typ))? {
                Some(next) => *self = next,
                None => {
                    self.finished = true;
                    return Ok(None);
                }
            }
        }
    }
}

fn ref_matches(rec: &RefRecord, oid: &[u8]) -> bool {
    match &rec.value {
        RefValue::Direct(id) => id == oid,
        RefValue::Peeled { id, peeled } => id == oid || peeled == oid,
        RefValue::Deletion | RefValue::Symref(_) => false,
    }
}

/// Scans ref records and keeps only those resolving to one object id.
struct FilteringRefIterator<'a, S: BlockSource> {
    oid: Vec<u8>,
    inner: TableIterator<'a, S>,
}

impl<S: BlockSource> FilteringRefIterator<'_, S> {
    fn next_ref(&mut self) -> Result<Option<RefRecord>> {
        while let Some(rec) = self.inner.next_record()? {
            if let Record::Ref(r) = rec {
                if ref_matches(&r, &self.oid) {
                    return Ok(Some(r));
                }
            }
        }
        Ok(None)
    }
}

/// Walks the ref blocks named by an obj record's offset list, re-checking
/// every candidate against the full object id.
struct IndexedRefIterator<'a, S: BlockSource> {
    table: &'a Table<S>,
    oid: Vec<u8>,
    offsets: std::vec::IntoIter<u64>,
    cur: Option<BlockIterator>,
}

impl<S: BlockSource> IndexedRefIterator<'_, S> {
    fn next_ref(&mut self) -> Result<Option<RefRecord>> {
        loop {
            if let Some(bi) = self.cur.as_mut() {
                match bi.next_record()? {
                    Some(Record::Ref(mut rec)) => {
                        rec.update_index += self.table.min_update_index();
                        if ref_matches(&rec, &self.oid) {
                            return Ok(Some(rec));
                        }
                    }
                    Some(_) => return Err(Error::Format("obj index points into a non-ref block")),
                    None => self.cur = None,
                }
                continue;
            }
            let Some(off) = self.offsets.next() else {
                return Ok(None);
            };
            let Some(br) = self.table.block_reader_at(off, Some(BlockType::Ref))? else {
                return Err(Error::Format("obj index points past the ref section"));
            };
            self.cur = Some(br.into_iter());
        }
    }
}

enum RefsForInner<'a, S: BlockSource> {
    Indexed(IndexedRefIterator<'a, S>),
    Scan(FilteringRefIterator<'a, S>),
    Empty,
}

/// Iterator over all refs pointing at one object id.
pub struct RefsForIterator<'a, S: BlockSource> {
    inner: RefsForInner<'a, S>,
}

impl<S: BlockSource> Iterator for RefsForIterator<'_, S> {
    type Item = Result<RefRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = match &mut self.inner {
            RefsForInner::Indexed(it) => it.next_ref(),
            RefsForInner::Scan(it) => it.next_ref(),
            RefsForInner::Empty => Ok(None),
        };
        next.transpose()
    }
}

pub(crate) fn refs_for<'a, S: BlockSource>(
    table: &'a Table<S>,
    oid: &[u8],
) -> Result<RefsForIterator<'a, S>> {
    if oid.len() != table.hash_id().size() {
        return Err(Error::Api("object id has the wrong length"));
    }
    let scan = |table: &'a Table<S>| -> Result<RefsForInner<'a, S>> {
        Ok(RefsForInner::Scan(FilteringRefIterator {
            oid: oid.to_vec(),
            inner: table.seek(BlockType::Ref, b"")?,
        }))
    };

    if !table.offsets_for(BlockType::Obj).present {
        return Ok(RefsForIterator {
            inner: scan(table)?,
        });
    }

    let prefix = &oid[..table.object_id_len().min(oid.len())];
    let mut obj_iter = table.seek(BlockType::Obj, prefix)?;
    let inner = match obj_iter.next_record()? {
        Some(Record::Obj(o)) if o.hash_prefix == prefix => {
            if o.offsets.is_empty() {
                // Too many refs shared this prefix at write time; the
                // offsets were dropped and only the scan knows the truth.
                scan(table)?
            } else {
                RefsForInner::Indexed(IndexedRefIterator {
                    table,
                    oid: oid.to_vec(),
                    offsets: o.offsets.into_iter(),
                    cur: None,
                })
            }
        }
        _ => RefsForInner::Empty,
    };
    Ok(RefsForIterator { inner })
}
