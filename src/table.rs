mod builder;
mod iterator;

use bytes::Buf;

pub use builder::{SectionStats, Stats, TableBuilder};
pub use iterator::{RefsForIterator, TableIterator};

use crate::block::BlockReader;
use crate::codec::get_u24;
use crate::config::{footer_size, header_size, HashId, DEFAULT_BLOCK_SIZE, MAGIC};
use crate::error::{Error, Result};
use crate::iterators::{LogIterator, RefIterator};
use crate::record::{BlockType, LogRecord};
use crate::source::BlockSource;

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SectionOffsets {
    pub(crate) present: bool,
    pub(crate) offset: u64,
    pub(crate) index_offset: u64,
}

/// Read-only view of a single reftable. Construction parses and verifies
/// the footer; all further state is immutable, and iterators borrow the
/// table for their whole lifetime.
#[derive(Debug)]
pub struct Table<S: BlockSource> {
    source: S,
    name: String,
    version: u8,
    block_size: u32,
    min_update_index: u64,
    max_update_index: u64,
    hash_id: HashId,
    /// Width of the truncated object-id prefixes keying the obj section.
    object_id_len: usize,
    /// Readable bytes excluding the footer.
    size: u64,
    ref_offsets: SectionOffsets,
    obj_offsets: SectionOffsets,
    log_offsets: SectionOffsets,
}

impl<S: BlockSource> Table<S> {
    /// Opens a table, failing fast on any structural problem: bad magic or
    /// version, a footer that does not repeat the header, or a CRC
    /// mismatch.
    pub fn open(source: S, name: &str) -> Result<Table<S>> {
        // +1 to learn the type of the first block.
        let probe_len = header_size(2) + 1;
        let probe = source.read_block(0, probe_len)?;
        if &probe[..4] != MAGIC {
            return Err(Error::Format("bad magic"));
        }
        let version = probe[4];
        if version != 1 && version != 2 {
            return Err(Error::Format("unsupported version"));
        }

        let size = source
            .size()
            .checked_sub(footer_size(version) as u64)
            .filter(|&s| s >= header_size(version) as u64)
            .ok_or(Error::Format("table too small"))?;
        let footer = source.read_block(size, footer_size(version))?;

        let hs = header_size(version);
        if footer[..hs] != probe[..hs] {
            return Err(Error::Format("footer does not match header"));
        }

        let crc_at = hs + 5 * 8;
        let computed = crc32fast::hash(&footer[..crc_at]);
        let stored = (&footer[crc_at..]).get_u32();
        if computed != stored {
            return Err(Error::Format("footer crc mismatch"));
        }

        let block_size = get_u24(&footer[5..]);
        let mut rd = &footer[8..];
        let min_update_index = rd.get_u64();
        let max_update_index = rd.get_u64();
        let hash_id = if version == 1 {
            HashId::Sha1
        } else {
            HashId::from_wire(rd.get_u32())?
        };

        let ref_index_offset = rd.get_u64();
        let obj_packed = rd.get_u64();
        let object_id_len = (obj_packed & 0x1f) as usize;
        let obj_offset = obj_packed >> 5;
        let obj_index_offset = rd.get_u64();
        let log_offset = rd.get_u64();
        let log_index_offset = rd.get_u64();

        let first_block_type = probe[hs];
        let table = Table {
            source,
            name: name.to_string(),
            version,
            block_size,
            min_update_index,
            max_update_index,
            hash_id,
            object_id_len,
            size,
            ref_offsets: SectionOffsets {
                present: first_block_type == BlockType::Ref.tag(),
                offset: 0,
                index_offset: ref_index_offset,
            },
            obj_offsets: SectionOffsets {
                present: obj_offset > 0,
                offset: obj_offset,
                index_offset: obj_index_offset,
            },
            log_offsets: SectionOffsets {
                present: first_block_type == BlockType::Log.tag() || log_offset > 0,
                offset: log_offset,
                index_offset: log_index_offset,
            },
        };
        log::debug!(
            "opened table {} v{} [{}..{}]",
            table.name,
            table.version,
            table.min_update_index,
            table.max_update_index
        );
        Ok(table)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
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

    /// Positions an iterator at the first ref whose name is ≥ `name`.
    pub fn seek_ref(&self, name: &str) -> Result<RefIterator<TableIterator<'_, S>>> {
        Ok(RefIterator::new(self.seek(
            BlockType::Ref,
            name.as_bytes(),
        )?))
    }

    /// Reflog entries for `name`, newest first.
    pub fn seek_log(&self, name: &str) -> Result<LogIterator<TableIterator<'_, S>>> {
        self.seek_log_at(name, u64::MAX)
    }

    /// Reflog entries for `name` whose update index is ≤ `update_index`,
    /// newest first.
    pub fn seek_log_at(
        &self,
        name: &str,
        update_index: u64,
    ) -> Result<LogIterator<TableIterator<'_, S>>> {
        let key = LogRecord::key_for(name, update_index);
        Ok(LogIterator::new(self.seek(BlockType::Log, &key)?))
    }

    /// All refs whose value (or peeled value) is exactly `oid`. Uses the
    /// obj index when the table carries one, otherwise a filtering scan of
    /// the whole ref section.
    pub fn refs_for(&self, oid: &[u8]) -> Result<RefsForIterator<'_, S>> {
        iterator::refs_for(self, oid)
    }

    pub(crate) fn seek(&self, typ: BlockType, key: &[u8]) -> Result<TableIterator<'_, S>> {
        if !self.offsets_for(typ).present {
            return Ok(TableIterator::empty(self, typ));
        }
        TableIterator::seek(self, typ, key)
    }

    pub(crate) fn offsets_for(&self, typ: BlockType) -> &SectionOffsets {
        match typ {
            BlockType::Ref => &self.ref_offsets,
            BlockType::Obj => &self.obj_offsets,
            BlockType::Log => &self.log_offsets,
            BlockType::Index => unreachable!("index blocks are not a section"),
        }
    }

    pub(crate) fn object_id_len(&self) -> usize {
        self.object_id_len
    }

    /// Reads and parses the block starting at `next_off`. Returns `None`
    /// when the offset is past the last block or the block's type is not
    /// the wanted one (the section ended there).
    pub(crate) fn block_reader_at(
        &self,
        next_off: u64,
        want: Option<BlockType>,
    ) -> Result<Option<BlockReader>> {
        if next_off >= self.size {
            return Ok(None);
        }
        let guess = if self.block_size > 0 {
            self.block_size
        } else {
            DEFAULT_BLOCK_SIZE
        } as u64;
        let header_off = if next_off == 0 {
            header_size(self.version)
        } else {
            0
        };

        let len = guess.min(self.size - next_off) as usize;
        if len < header_off + 4 {
            return Err(Error::Format("truncated block"));
        }
        let mut block = self.source.read_block(next_off, len)?;

        let tag = block[header_off];
        match want {
            Some(w) if w.tag() != tag => return Ok(None),
            _ => {}
        }

        // Blocks may exceed the guessed size (compressed log tails, the
        // oversized first read); fetch the remainder before parsing.
        let sz = get_u24(&block[header_off + 1..]) as usize;
        let full = header_off + sz;
        if full > block.len() {
            if next_off + full as u64 > self.size {
                return Err(Error::Format("block extends past end of table"));
            }
            block = self.source.read_block(next_off, full)?;
        }

        BlockReader::init(block, header_off, self.block_size, self.hash_id.size()).map(Some)
    }
}
