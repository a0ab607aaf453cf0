use crate::codec::get_uvarint;
use crate::error::{Error, Result};
use crate::record::Record;

use super::BlockReader;

/// Sequential decoder over one block. State is the offset of the next
/// record and the key of the last one, which the prefix compression is
/// resolved against.
pub struct BlockIterator {
    br: BlockReader,
    next_off: usize,
    last_key: Vec<u8>,
}

impl BlockIterator {
    pub(crate) fn new(br: BlockReader) -> Self {
        let next_off = br.records_start();
        Self {
            br,
            next_off,
            last_key: Vec::new(),
        }
    }

    pub fn reader(&self) -> &BlockReader {
        &self.br
    }

    /// Key of the most recently returned record.
    pub fn key(&self) -> &[u8] {
        &self.last_key
    }

    /// Decodes the next record, or `None` once the restart array is
    /// reached.
    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.next_off >= self.br.restart_start() {
            return Ok(None);
        }
        let region = &self.br.records()[self.next_off..];
        let mut rd = region;

        let shared = get_uvarint(&mut rd)? as usize;
        let suffix_len = get_uvarint(&mut rd)? as usize;
        let extra = get_uvarint(&mut rd)?;
        if shared > self.last_key.len() {
            return Err(Error::Format("shared prefix exceeds previous key"));
        }
        if extra > 0xf {
            return Err(Error::Format("value type out of range"));
        }
        if rd.len() < suffix_len {
            return Err(Error::Format("truncated record"));
        }
        let (suffix, mut value) = rd.split_at(suffix_len);

        self.last_key.truncate(shared);
        self.last_key.extend_from_slice(suffix);

        let rec = Record::decode(
            self.br.block_type(),
            &self.last_key,
            extra as u8,
            &mut value,
            self.br.hash_size(),
        )?;
        self.next_off += region.len() - value.len();
        Ok(Some(rec))
    }

    /// Positions the iterator so the next [`next_record`](Self::next_record)
    /// yields the first record with key ≥ `want`: binary search for the
    /// last restart at or before `want`, then a linear scan.
    pub fn seek(&mut self, want: &[u8]) -> Result<()> {
        let mut lo = 0usize;
        let mut hi = self.br.restart_count() as usize;
        // Lower bound: first restart whose key is strictly greater.
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.br.restart_key(mid)? <= want {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        self.next_off = if lo > 0 {
            self.br.restart_offset(lo - 1)
        } else {
            self.br.records_start()
        };
        self.last_key.clear();

        loop {
            let saved_off = self.next_off;
            let saved_key = self.last_key.clone();
            match self.next_record()? {
                None => return Ok(()),
                Some(_) => {
                    if self.last_key.as_slice() >= want {
                        self.next_off = saved_off;
                        self.last_key = saved_key;
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::super::BlockBuilder;
    use super::*;
    use crate::record::{BlockType, RefRecord, RefValue};

    fn block_of(names: &[&str]) -> BlockReader {
        let mut bw = BlockBuilder::new(BlockType::Ref, 1 << 16, 0, 4, 20);
        for name in names {
            let rec = Record::Ref(RefRecord {
                ref_name: (*name).into(),
                update_index: 1,
                value: RefValue::Direct(vec![7; 20]),
            });
            assert!(bw.add(&rec).unwrap());
        }
        BlockReader::init(Bytes::from(bw.finish().unwrap()), 0, 0, 20).unwrap()
    }

    fn names() -> Vec<String> {
        (0..50).map(|i| format!("refs/heads/{i:03}")).collect()
    }

    #[test]
    fn seek_finds_successor() {
        let names = names();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let mut it = block_of(&refs).into_iter();

        // Exact hit, including on restart boundaries.
        for want in ["refs/heads/000", "refs/heads/004", "refs/heads/037"] {
            it.seek(want.as_bytes()).unwrap();
            let rec = it.next_record().unwrap().unwrap();
            assert_eq!(rec.key(), want.as_bytes());
        }

        // Between keys: smallest key greater than the probe.
        it.seek(b"refs/heads/0105").unwrap();
        let rec = it.next_record().unwrap().unwrap();
        assert_eq!(rec.key(), b"refs/heads/011");

        // Before the first key.
        it.seek(b"").unwrap();
        let rec = it.next_record().unwrap().unwrap();
        assert_eq!(rec.key(), b"refs/heads/000");

        // Past the last key: exhausted.
        it.seek(b"refs/tags/zz").unwrap();
        assert!(it.next_record().unwrap().is_none());
    }

    #[test]
    fn seek_then_scan_stays_ordered() {
        let names = names();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let mut it = block_of(&refs).into_iter();
        it.seek(b"refs/heads/040").unwrap();
        let mut got = Vec::new();
        while let Some(rec) = it.next_record().unwrap() {
            got.push(String::from_utf8(rec.key()).unwrap());
        }
        assert_eq!(got, &names[40..]);
    }
}
