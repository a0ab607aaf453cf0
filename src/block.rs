mod builder;
mod iterator;

use std::io::Read;

pub use builder::BlockBuilder;
use bytes::{Buf, Bytes};
pub use iterator::BlockIterator;

use crate::codec::{get_u24, get_uvarint};
use crate::error::{Error, Result};
use crate::record::BlockType;

/// A parsed block: the raw bytes (decompressed for log blocks), the restart
/// table, and the block's on-disk footprint so the caller can locate its
/// successor.
#[derive(Debug)]
pub struct BlockReader {
    /// Logical block contents. For log blocks this is a fresh owned buffer;
    /// for everything else it references the source's buffer.
    data: Bytes,
    /// Offset of the block header. Nonzero only for the first block of a
    /// table, which embeds the file header.
    header_off: usize,
    /// Absolute offset where the restart array begins; records end here.
    restart_start: usize,
    restart_count: u16,
    /// On-disk size including `header_off`. For padded block kinds this is
    /// the table's block size; for log blocks, the compressed size.
    full_block_size: usize,
    hash_size: usize,
    typ: BlockType,
}

impl BlockReader {
    /// Parses a raw block. `table_block_size` is the block size declared in
    /// the file footer; it bounds log-block decompression and identifies
    /// padded blocks. Pass 0 when the block is known to be unpadded.
    pub fn init(
        block: Bytes,
        header_off: usize,
        table_block_size: u32,
        hash_size: usize,
    ) -> Result<BlockReader> {
        if block.len() < header_off + 4 {
            return Err(Error::Format("truncated block header"));
        }
        let typ =
            BlockType::from_tag(block[header_off]).ok_or(Error::Format("unknown block type"))?;
        let sz = get_u24(&block[header_off + 1..]) as usize;
        let end = header_off + sz;
        if end > block.len() || sz < 4 + 2 {
            return Err(Error::Format("block length out of bounds"));
        }

        if typ == BlockType::Log {
            return Self::init_log(block, header_off, end, table_block_size, hash_size);
        }

        let tbs = table_block_size as usize;
        // A block shorter than the block size is either the unpadded tail
        // of its section or is followed by zero padding up to the boundary.
        let full_block_size = if tbs == 0 || end >= tbs {
            end
        } else if end >= block.len() || block[end] != 0 {
            end
        } else {
            tbs
        };

        let (restart_start, restart_count) = restart_table(&block, header_off, end)?;
        Ok(BlockReader {
            data: block,
            header_off,
            restart_start,
            restart_count,
            full_block_size,
            hash_size,
            typ,
        })
    }

    /// Log blocks keep their restart array uncompressed after the deflated
    /// record region; rebuild the logical layout the restart offsets were
    /// recorded against.
    fn init_log(
        block: Bytes,
        header_off: usize,
        end: usize,
        table_block_size: u32,
        hash_size: usize,
    ) -> Result<BlockReader> {
        let (restart_start, restart_count) = restart_table(&block, header_off, end)?;
        let compressed = &block[header_off + 4..restart_start];

        let limit = table_block_size as usize;
        let mut records = Vec::with_capacity(limit);
        let mut decoder = flate2::bufread::ZlibDecoder::new(compressed);
        decoder
            .read_to_end(&mut records)
            .map_err(|_| Error::Format("log block decompression failed"))?;

        let restart_bytes = end - restart_start;
        let logical_len = header_off + 4 + records.len() + restart_bytes;
        if limit > 0 && logical_len > limit {
            return Err(Error::Format("log block exceeds block size"));
        }

        let mut data = Vec::with_capacity(logical_len);
        data.extend_from_slice(&block[..header_off + 4]);
        data.extend_from_slice(&records);
        data.extend_from_slice(&block[restart_start..end]);

        Ok(BlockReader {
            restart_start: logical_len - restart_bytes,
            data: Bytes::from(data),
            header_off,
            restart_count,
            full_block_size: end,
            hash_size,
            typ: BlockType::Log,
        })
    }

    pub fn block_type(&self) -> BlockType {
        self.typ
    }

    /// On-disk footprint; the next block of the section starts this many
    /// bytes after this one.
    pub fn full_block_size(&self) -> usize {
        self.full_block_size
    }

    /// Decodes the first key. The first record of a block always encodes
    /// its key in full.
    pub fn first_key(&self) -> Result<Vec<u8>> {
        Ok(self.key_at(self.records_start())?.to_vec())
    }

    pub fn into_iter(self) -> BlockIterator {
        BlockIterator::new(self)
    }

    pub(crate) fn records_start(&self) -> usize {
        self.header_off + 4
    }

    pub(crate) fn restart_start(&self) -> usize {
        self.restart_start
    }

    pub(crate) fn restart_count(&self) -> u16 {
        self.restart_count
    }

    pub(crate) fn restart_offset(&self, i: usize) -> usize {
        let at = self.restart_start + 2 * i;
        (&self.data[at..]).get_u16() as usize
    }

    /// Key of the `i`-th restart record; restarts never share a prefix.
    pub(crate) fn restart_key(&self, i: usize) -> Result<&[u8]> {
        self.key_at(self.restart_offset(i))
    }

    pub(crate) fn hash_size(&self) -> usize {
        self.hash_size
    }

    pub(crate) fn records(&self) -> &[u8] {
        &self.data[..self.restart_start]
    }

    fn key_at(&self, off: usize) -> Result<&[u8]> {
        if off < self.records_start() || off >= self.restart_start {
            return Err(Error::Format("restart offset out of bounds"));
        }
        let mut rd = &self.data[off..self.restart_start];
        let shared = get_uvarint(&mut rd)?;
        if shared != 0 {
            return Err(Error::Format("restart record shares a prefix"));
        }
        let suffix_len = get_uvarint(&mut rd)? as usize;
        let _extra = get_uvarint(&mut rd)?;
        if rd.len() < suffix_len {
            return Err(Error::Format("truncated record"));
        }
        Ok(&rd[..suffix_len])
    }
}

fn restart_table(block: &Bytes, header_off: usize, end: usize) -> Result<(usize, u16)> {
    let restart_count = (&block[end - 2..]).get_u16();
    let restart_start = end
        .checked_sub(2 + 2 * restart_count as usize)
        .ok_or(Error::Format("restart array inconsistent"))?;
    if restart_start < header_off + 4 {
        return Err(Error::Format("restart array inconsistent"));
    }
    Ok((restart_start, restart_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Record, RefRecord, RefValue};

    fn ref_rec(name: &str, idx: u64) -> Record {
        Record::Ref(RefRecord {
            ref_name: name.into(),
            update_index: idx,
            value: RefValue::Direct(vec![idx as u8; 20]),
        })
    }

    fn build_block(names: &[&str]) -> Bytes {
        let mut bw = BlockBuilder::new(BlockType::Ref, 4096, 0, 16, 20);
        for (i, name) in names.iter().enumerate() {
            assert!(bw.add(&ref_rec(name, i as u64)).unwrap());
        }
        Bytes::from(bw.finish().unwrap())
    }

    #[test]
    fn parse_and_iterate() {
        let names = ["refs/heads/a", "refs/heads/b", "refs/tags/v1"];
        let br = BlockReader::init(build_block(&names), 0, 4096, 20).unwrap();
        assert_eq!(br.block_type(), BlockType::Ref);
        assert_eq!(br.first_key().unwrap(), b"refs/heads/a");

        let mut it = br.into_iter();
        let mut got = Vec::new();
        while let Some(rec) = it.next_record().unwrap() {
            got.push(String::from_utf8(rec.key()).unwrap());
        }
        assert_eq!(got, names);
    }

    #[test]
    fn restarts_encode_full_keys() {
        let names: Vec<String> = (0..100).map(|i| format!("refs/heads/{i:04}")).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let br = BlockReader::init(build_block(&refs), 0, 1 << 16, 20).unwrap();
        assert!(br.restart_count() > 1);
        let mut prev: Option<Vec<u8>> = None;
        for i in 0..br.restart_count() as usize {
            let key = br.restart_key(i).unwrap().to_vec();
            if let Some(p) = &prev {
                assert!(*p < key, "restart keys must be strictly increasing");
            }
            prev = Some(key);
        }
    }

    #[test]
    fn rejects_bad_type() {
        let mut raw = build_block(&["refs/heads/a"]).to_vec();
        raw[0] = b'x';
        let err = BlockReader::init(Bytes::from(raw), 0, 4096, 20).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
    }

    #[test]
    fn padded_block_footprint() {
        let mut raw = build_block(&["refs/heads/a"]).to_vec();
        let unpadded = raw.len();
        raw.resize(512, 0);
        let br = BlockReader::init(Bytes::from(raw), 0, 512, 20).unwrap();
        assert_eq!(br.full_block_size(), 512);

        // The unpadded tail of a section reports its own length.
        let br = BlockReader::init(build_block(&["refs/heads/a"]), 0, 512, 20).unwrap();
        assert_eq!(br.full_block_size(), unpadded);
    }
}
