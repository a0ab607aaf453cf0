use std::io::Write;

use bytes::BufMut;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::codec::{common_prefix, put_u24, put_uvarint, uvarint_len};
use crate::error::{Error, Result};
use crate::record::{BlockType, Record};

/// Builds one block: prefix-compressed records, restart array, and for log
/// blocks the deflate pass over the record region.
pub struct BlockBuilder {
    typ: BlockType,
    /// Encoded block so far. The first `header_off + 4` bytes are the file
    /// header placeholder (first block only) plus the block header.
    buf: Vec<u8>,
    block_size: usize,
    header_off: usize,
    restart_interval: u16,
    hash_size: usize,
    restarts: Vec<u16>,
    entries: usize,
    first_key: Vec<u8>,
    last_key: Vec<u8>,
    scratch: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(
        typ: BlockType,
        block_size: u32,
        header_off: usize,
        restart_interval: u16,
        hash_size: usize,
    ) -> Self {
        let mut buf = vec![0u8; header_off + 4];
        buf[header_off] = typ.tag();
        Self {
            typ,
            buf,
            block_size: block_size as usize,
            header_off,
            restart_interval,
            hash_size,
            restarts: Vec::new(),
            entries: 0,
            first_key: Vec::new(),
            last_key: Vec::new(),
            scratch: Vec::new(),
        }
    }

    pub fn block_type(&self) -> BlockType {
        self.typ
    }

    /// Appends `rec`. Returns `Ok(false)` when the encoded record plus the
    /// restart array it implies would overflow the block; the caller then
    /// flushes and retries on a fresh block.
    pub fn add(&mut self, rec: &Record) -> Result<bool> {
        debug_assert_eq!(rec.block_type(), self.typ);
        let key = rec.key();
        let restart = self.entries % self.restart_interval as usize == 0
            && self.buf.len() <= u16::MAX as usize;
        let prev: &[u8] = if restart { &[] } else { &self.last_key };

        let shared = common_prefix(prev, &key);
        let suffix = &key[shared..];
        self.scratch.clear();
        let extra = rec.encode_value(&mut self.scratch, self.hash_size)?;

        let entry_len = uvarint_len(shared as u64)
            + uvarint_len(suffix.len() as u64)
            + uvarint_len(u64::from(extra))
            + suffix.len()
            + self.scratch.len();
        let restart_len = self.restarts.len() + usize::from(restart);
        if self.buf.len() + entry_len + 2 + 2 * restart_len > self.block_size {
            return Ok(false);
        }

        if restart {
            self.restarts.push(self.buf.len() as u16);
        }
        put_uvarint(&mut self.buf, shared as u64);
        put_uvarint(&mut self.buf, suffix.len() as u64);
        put_uvarint(&mut self.buf, u64::from(extra));
        self.buf.put_slice(suffix);
        self.buf.put_slice(&self.scratch);

        if self.entries == 0 {
            self.first_key = key.clone();
        }
        self.last_key = key;
        self.entries += 1;
        Ok(true)
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn first_key(&self) -> &[u8] {
        &self.first_key
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Seals the block and returns its on-disk bytes: restart array and
    /// count appended, length field filled in, and for log blocks the
    /// record region deflated with the restart array moved down after it.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        debug_assert!(self.entries > 0, "finishing an empty block");
        let restart_start = self.buf.len();
        for &r in &self.restarts {
            self.buf.put_u16(r);
        }
        self.buf.put_u16(self.restarts.len() as u16);

        if self.typ == BlockType::Log {
            let mut encoder = ZlibEncoder::new(
                Vec::with_capacity(restart_start - self.header_off),
                Compression::default(),
            );
            encoder.write_all(&self.buf[self.header_off + 4..restart_start])?;
            let compressed = encoder.finish()?;

            let mut out = Vec::with_capacity(self.header_off + 4 + compressed.len());
            out.extend_from_slice(&self.buf[..self.header_off + 4]);
            out.extend_from_slice(&compressed);
            out.extend_from_slice(&self.buf[restart_start..]);
            self.buf = out;
        }

        let block_len = self.buf.len() - self.header_off;
        if block_len >= 1 << 24 {
            return Err(Error::Format("block length overflows u24"));
        }
        let header_off = self.header_off;
        put_u24(&mut self.buf[header_off + 1..header_off + 4], block_len as u32);
        Ok(self.buf)
    }
}
