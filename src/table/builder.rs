use std::collections::BTreeMap;
use std::io::Write;

use bytes::BufMut;

use crate::block::BlockBuilder;
use crate::codec::{common_prefix, put_u24};
use crate::config::{header_size, WriteOptions, MAGIC};
use crate::error::{Error, Result};
use crate::record::{BlockType, IndexRecord, LogRecord, ObjRecord, Record, RefRecord, RefValue};

/// Write an index only when a section spans more than this many blocks; a
/// linear scan over a handful of blocks beats the extra level.
const INDEX_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct SectionStats {
    pub blocks: usize,
    pub index_blocks: usize,
    /// Offset of the section's first block.
    pub offset: u64,
    /// Offset of the topmost index level, 0 when no index was written.
    pub index_offset: u64,
    pub max_index_level: usize,
}

/// Shape of the finished table, returned by [`TableBuilder::finish`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub refs: SectionStats,
    pub objs: SectionStats,
    pub logs: SectionStats,
    /// Width of the object-id prefixes keying the obj section.
    pub object_id_len: usize,
}

/// Assembles a complete table: ref blocks, the derived obj section, log
/// blocks, per-section indexes, and the footer. Records must arrive in
/// strictly increasing key order, refs before logs.
///
/// On any error the sink's contents are undefined; callers discard the
/// partial file.
pub struct TableBuilder<W: Write> {
    out: W,
    opts: WriteOptions,
    hash_size: usize,
    /// File offset where the block under construction will land.
    next_off: u64,
    block: Option<BlockBuilder>,
    /// One entry per flushed block of the current section (or index
    /// level); drained when the section finishes.
    index: Vec<IndexRecord>,
    last_key: Vec<u8>,
    /// Full object id → offsets of the ref blocks mentioning it.
    obj_index: BTreeMap<Vec<u8>, Vec<u64>>,
    log_section_started: bool,
    index_block_count: usize,
    stats: Stats,
}

impl<W: Write> TableBuilder<W> {
    pub fn new(out: W, opts: WriteOptions) -> Result<TableBuilder<W>> {
        opts.validate()?;
        let hash_size = opts.hash_id.size();
        Ok(TableBuilder {
            out,
            opts,
            hash_size,
            next_off: 0,
            block: None,
            index: Vec::new(),
            last_key: Vec::new(),
            obj_index: BTreeMap::new(),
            log_section_started: false,
            index_block_count: 0,
            stats: Stats::default(),
        })
    }

    /// Adds one ref. Refs must be strictly increasing by name and precede
    /// all log records; the update index must lie within the declared
    /// bounds.
    pub fn add_ref(&mut self, rec: &RefRecord) -> Result<()> {
        if rec.ref_name.is_empty() {
            return Err(Error::Api("ref name must not be empty"));
        }
        if rec.update_index < self.opts.min_update_index
            || rec.update_index > self.opts.max_update_index
        {
            return Err(Error::Api("ref update index outside declared bounds"));
        }
        if self.log_section_started {
            return Err(Error::Api("refs must be added before logs"));
        }

        let mut stored = rec.clone();
        stored.update_index = rec.update_index - self.opts.min_update_index;
        if !self.push_record(&Record::Ref(stored))? {
            return Err(Error::Api("ref record too large for block size"));
        }

        match &rec.value {
            RefValue::Direct(id) => self.index_object(id),
            RefValue::Peeled { id, peeled } => {
                self.index_object(id);
                self.index_object(peeled);
            }
            RefValue::Deletion | RefValue::Symref(_) => {}
        }
        Ok(())
    }

    /// Adds one log entry. Log keys (name, then descending update index)
    /// must be strictly increasing. Unless `exact_log_message` is set the
    /// message is normalized to a single line ending in `\n`.
    pub fn add_log(&mut self, rec: &LogRecord) -> Result<()> {
        if rec.ref_name.is_empty() {
            return Err(Error::Api("ref name must not be empty"));
        }
        if !self.log_section_started {
            self.finish_public_section()?;
            self.log_section_started = true;
        }

        let mut stored = rec.clone();
        if let Some(update) = &mut stored.value {
            if !self.opts.exact_log_message {
                let trimmed = update.message.trim_end_matches('\n');
                if trimmed.contains('\n') {
                    return Err(Error::Api("log message must be a single line"));
                }
                update.message = format!("{trimmed}\n");
            }
        }

        if !self.push_record(&Record::Log(stored))? {
            return Err(Error::Api("log record too large for block size"));
        }
        Ok(())
    }

    /// Finishes the open sections, writes the footer and returns the
    /// table's statistics.
    pub fn finish(mut self) -> Result<Stats> {
        self.finish_public_section()?;
        if self.next_off == 0 {
            // A table with no records still carries its header.
            let header = self.encode_header();
            self.write_all(&header)?;
            self.next_off = header.len() as u64;
        }
        let footer = self.encode_footer();
        self.write_all(&footer)?;
        self.out.flush()?;
        log::debug!(
            "finished table: {} ref, {} obj, {} log blocks",
            self.stats.refs.blocks,
            self.stats.objs.blocks,
            self.stats.logs.blocks
        );
        Ok(self.stats)
    }

    /// Appends `rec` to the open block, flushing and retrying on a fresh
    /// block when full. `Ok(false)` means the record alone exceeds the
    /// block size.
    fn push_record(&mut self, rec: &Record) -> Result<bool> {
        let key = rec.key();
        if !self.last_key.is_empty() && self.last_key >= key {
            return Err(Error::Api("records must be strictly increasing by key"));
        }
        if self.block.is_none() {
            self.new_block(rec.block_type());
        }
        let block = self.block.as_mut().expect("block was just created");
        if block.block_type() != rec.block_type() {
            return Err(Error::Api("record kind does not match the open section"));
        }
        if block.add(rec)? {
            self.last_key = key;
            return Ok(true);
        }

        self.flush_block()?;
        self.new_block(rec.block_type());
        if self.block.as_mut().expect("block was just created").add(rec)? {
            self.last_key = key;
            return Ok(true);
        }
        Ok(false)
    }

    fn new_block(&mut self, typ: BlockType) {
        let header_off = if self.next_off == 0 {
            header_size(self.opts.version)
        } else {
            0
        };
        self.block = Some(BlockBuilder::new(
            typ,
            self.opts.block_size,
            header_off,
            self.opts.restart_interval,
            self.hash_size,
        ));
    }

    /// Writes out the block under construction, padding every kind except
    /// log blocks to occupy a full `block_size` on disk. Records the
    /// block's last key for the section index.
    fn flush_block(&mut self) -> Result<()> {
        let Some(block) = self.block.take() else {
            return Ok(());
        };
        if block.is_empty() {
            return Ok(());
        }
        let typ = block.block_type();
        let last_key = block.last_key().to_vec();
        let entries = block.entries();
        let mut data = block.finish()?;
        if self.next_off == 0 {
            let header = self.encode_header();
            data[..header.len()].copy_from_slice(&header);
        }

        let start_off = self.next_off;
        let on_disk = if typ == BlockType::Log {
            data.len()
        } else {
            debug_assert!(data.len() <= self.opts.block_size as usize);
            data.resize(self.opts.block_size as usize, 0);
            data.len()
        };
        self.write_all(&data)?;
        self.next_off += on_disk as u64;

        self.index.push(IndexRecord {
            last_key,
            offset: start_off,
        });
        if typ == BlockType::Index {
            self.index_block_count += 1;
        } else {
            let stats = self.stats_for_mut(typ);
            if stats.blocks == 0 {
                stats.offset = start_off;
            }
            stats.blocks += 1;
        }
        log::debug!("flushed {:?} block at {start_off}: {entries} records", typ);
        Ok(())
    }

    /// Flushes the section's tail block, then folds the accumulated
    /// `(last_key, offset)` pairs into index levels until one level is
    /// small enough to scan linearly.
    fn finish_section(&mut self, typ: BlockType) -> Result<()> {
        let before_index_blocks = self.index_block_count;
        self.flush_block()?;

        let mut index_start = 0;
        let mut max_level = 0;
        while self.index.len() > INDEX_THRESHOLD {
            max_level += 1;
            index_start = self.next_off;
            let level = std::mem::take(&mut self.index);
            self.last_key.clear();
            for rec in level {
                if !self.push_record(&Record::Index(rec))? {
                    return Err(Error::Api("index record too large for block size"));
                }
            }
            self.flush_block()?;
        }
        self.index.clear();
        self.last_key.clear();

        let index_blocks = self.index_block_count - before_index_blocks;
        let stats = self.stats_for_mut(typ);
        stats.index_blocks = index_blocks;
        stats.index_offset = index_start;
        stats.max_index_level = max_level;
        Ok(())
    }

    fn finish_public_section(&mut self) -> Result<()> {
        let Some(typ) = self.block.as_ref().map(|b| b.block_type()) else {
            return Ok(());
        };
        self.finish_section(typ)?;
        if typ == BlockType::Ref && !self.obj_index.is_empty() {
            self.dump_obj_index()?;
        }
        Ok(())
    }

    /// Emits the obj section: every indexed object id truncated to the
    /// shortest prefix that still tells them apart, with the offsets of
    /// the ref blocks mentioning it.
    fn dump_obj_index(&mut self) -> Result<()> {
        let mut common = 0;
        let mut prev: Option<&[u8]> = None;
        for key in self.obj_index.keys() {
            if let Some(p) = prev {
                common = common.max(common_prefix(p, key));
            }
            prev = Some(key);
        }
        let object_id_len = (common + 1).clamp(2, self.hash_size);
        self.stats.object_id_len = object_id_len;

        let entries = std::mem::take(&mut self.obj_index);
        for (id, offsets) in entries {
            let rec = ObjRecord {
                hash_prefix: id[..object_id_len].to_vec(),
                offsets,
            };
            if !self.push_record(&Record::Obj(rec.clone()))? {
                // The offsets list alone overflows a block; keep the
                // prefix and let readers fall back to a filtering scan.
                let fallback = Record::Obj(ObjRecord {
                    hash_prefix: rec.hash_prefix,
                    offsets: Vec::new(),
                });
                if !self.push_record(&fallback)? {
                    return Err(Error::Api("obj record too large for block size"));
                }
            }
        }
        self.finish_section(BlockType::Obj)
    }

    fn index_object(&mut self, id: &[u8]) {
        let off = self.next_off;
        let offsets = self.obj_index.entry(id.to_vec()).or_default();
        if offsets.last() != Some(&off) {
            offsets.push(off);
        }
    }

    fn stats_for_mut(&mut self, typ: BlockType) -> &mut SectionStats {
        match typ {
            BlockType::Ref => &mut self.stats.refs,
            BlockType::Obj => &mut self.stats.objs,
            BlockType::Log => &mut self.stats.logs,
            BlockType::Index => unreachable!("index blocks are accounted per section"),
        }
    }

    fn encode_header(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(header_size(self.opts.version));
        buf.put_slice(MAGIC);
        buf.put_u8(self.opts.version);
        let mut bs = [0u8; 3];
        put_u24(&mut bs, self.opts.block_size);
        buf.put_slice(&bs);
        buf.put_u64(self.opts.min_update_index);
        buf.put_u64(self.opts.max_update_index);
        if self.opts.version == 2 {
            buf.put_u32(self.opts.hash_id.to_wire());
        }
        buf
    }

    fn encode_footer(&self) -> Vec<u8> {
        let mut buf = self.encode_header();
        buf.put_u64(self.stats.refs.index_offset);
        buf.put_u64(self.stats.objs.offset << 5 | self.stats.object_id_len as u64);
        buf.put_u64(self.stats.objs.index_offset);
        buf.put_u64(self.stats.logs.offset);
        buf.put_u64(self.stats.logs.index_offset);
        let crc = crc32fast::hash(&buf);
        buf.put_u32(crc);
        buf
    }

    /// A sink refusing bytes means the table hit its size limit; that is
    /// the one soft error the writer reports.
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.out.write_all(data).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WriteZero {
                Error::OutOfSpace
            } else {
                Error::Io(e)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn direct(name: &str, idx: u64, byte: u8) -> RefRecord {
        RefRecord {
            ref_name: name.into(),
            update_index: idx,
            value: RefValue::Direct(vec![byte; 20]),
        }
    }

    fn opts(min: u64, max: u64) -> WriteOptions {
        WriteOptions {
            min_update_index: min,
            max_update_index: max,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_out_of_order_refs() {
        let mut out = Vec::new();
        let mut b = TableBuilder::new(&mut out, opts(1, 1)).unwrap();
        b.add_ref(&direct("refs/heads/b", 1, 1)).unwrap();
        let err = b.add_ref(&direct("refs/heads/a", 1, 2)).unwrap_err();
        assert!(matches!(err, Error::Api(_)));
        // Duplicates are out of order too.
        let err = b.add_ref(&direct("refs/heads/b", 1, 3)).unwrap_err();
        assert!(matches!(err, Error::Api(_)));
    }

    #[test]
    fn rejects_update_index_outside_bounds() {
        let mut out = Vec::new();
        let mut b = TableBuilder::new(&mut out, opts(5, 9)).unwrap();
        assert!(matches!(
            b.add_ref(&direct("refs/heads/a", 4, 1)),
            Err(Error::Api(_))
        ));
        assert!(matches!(
            b.add_ref(&direct("refs/heads/a", 10, 1)),
            Err(Error::Api(_))
        ));
        b.add_ref(&direct("refs/heads/a", 7, 1)).unwrap();
    }

    #[test]
    fn rejects_refs_after_logs() {
        let mut out = Vec::new();
        let mut b = TableBuilder::new(&mut out, opts(1, 2)).unwrap();
        b.add_ref(&direct("refs/heads/a", 1, 1)).unwrap();
        b.add_log(&LogRecord {
            ref_name: "refs/heads/a".into(),
            update_index: 1,
            value: None,
        })
        .unwrap();
        assert!(matches!(
            b.add_ref(&direct("refs/heads/b", 2, 1)),
            Err(Error::Api(_))
        ));
    }

    #[test]
    fn normalizes_log_messages() {
        use crate::record::LogUpdate;
        let update = |message: &str| LogUpdate {
            old_id: vec![0; 20],
            new_id: vec![1; 20],
            name: "A U Thor".into(),
            email: "thor@example.com".into(),
            time_seconds: 0,
            tz_minutes: 0,
            message: message.into(),
        };
        let mut out = Vec::new();
        let mut b = TableBuilder::new(&mut out, opts(1, 9)).unwrap();
        b.add_log(&LogRecord {
            ref_name: "refs/heads/a".into(),
            update_index: 3,
            value: Some(update("commit: tip\n\n")),
        })
        .unwrap();
        let err = b
            .add_log(&LogRecord {
                ref_name: "refs/heads/a".into(),
                update_index: 2,
                value: Some(update("two\nlines")),
            })
            .unwrap_err();
        assert!(matches!(err, Error::Api(_)));

        // With exact messages the bytes pass through untouched.
        let mut out = Vec::new();
        let mut b = TableBuilder::new(
            &mut out,
            WriteOptions {
                exact_log_message: true,
                min_update_index: 1,
                max_update_index: 9,
                ..Default::default()
            },
        )
        .unwrap();
        b.add_log(&LogRecord {
            ref_name: "refs/heads/a".into(),
            update_index: 3,
            value: Some(update("two\nlines")),
        })
        .unwrap();
    }

    #[test]
    fn large_ref_section_gets_an_index() {
        let mut out = Vec::new();
        let mut b = TableBuilder::new(
            &mut out,
            WriteOptions {
                block_size: 256,
                min_update_index: 1,
                max_update_index: 1,
                ..Default::default()
            },
        )
        .unwrap();
        for i in 0..200 {
            b.add_ref(&direct(&format!("refs/heads/branch-{i:05}"), 1, i as u8))
                .unwrap();
        }
        let stats = b.finish().unwrap();
        assert!(stats.refs.blocks > INDEX_THRESHOLD);
        assert!(stats.refs.index_blocks > 0);
        assert!(stats.refs.index_offset > 0);
        assert!(stats.refs.max_index_level >= 1);
        // Every live ref value feeds the obj section.
        assert!(stats.objs.blocks > 0);
        assert!(stats.object_id_len >= 2);
    }

    #[test]
    fn out_of_space_is_soft() {
        struct Full;
        impl Write for Full {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let mut b = TableBuilder::new(Full, opts(1, 1)).unwrap();
        b.add_ref(&direct("refs/heads/a", 1, 1)).unwrap();
        assert!(matches!(b.finish(), Err(Error::OutOfSpace)));
    }
}
