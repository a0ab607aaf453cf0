//! The four record shapes stored in a reftable, their key derivation and
//! their wire encoding.
//!
//! Every record is framed the same way inside a block: two varints for the
//! shared/suffix key split, a varint carrying the kind-specific value-type
//! nibble, the key suffix, then the value bytes. The value encodings are
//! self-delimiting, so decoding consumes exactly one record from the front
//! of a slice.

use bytes::BufMut;

use crate::codec::{get_uvarint, put_uvarint, take};
use crate::error::{Error, Result};

/// One-byte tag identifying the stream a block belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Ref,
    Obj,
    Log,
    Index,
}

impl BlockType {
    pub fn from_tag(tag: u8) -> Option<BlockType> {
        match tag {
            b'r' => Some(BlockType::Ref),
            b'o' => Some(BlockType::Obj),
            b'l' => Some(BlockType::Log),
            b'i' => Some(BlockType::Index),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            BlockType::Ref => b'r',
            BlockType::Obj => b'o',
            BlockType::Log => b'l',
            BlockType::Index => b'i',
        }
    }
}

/// An object id, `hash_size` bytes long.
pub type ObjectId = Vec<u8>;

/// What a ref points at. The variant index is the on-disk value-type
/// nibble.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RefValue {
    /// Tombstone: the ref was removed as of this record's update index.
    #[default]
    Deletion,
    /// A direct ref.
    Direct(ObjectId),
    /// An annotated tag with its peeled target, for fast `^{}` resolution.
    Peeled { id: ObjectId, peeled: ObjectId },
    /// A symbolic ref naming its target ref.
    Symref(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RefRecord {
    pub ref_name: String,
    /// Transaction counter of the write batch that produced this record.
    /// Stored on disk as a delta against the table's `min_update_index`.
    pub update_index: u64,
    pub value: RefValue,
}

impl RefRecord {
    pub fn is_deletion(&self) -> bool {
        self.value == RefValue::Deletion
    }

    fn value_type(&self) -> u8 {
        match self.value {
            RefValue::Deletion => 0,
            RefValue::Direct(_) => 1,
            RefValue::Peeled { .. } => 2,
            RefValue::Symref(_) => 3,
        }
    }

    fn encode_value(&self, buf: &mut Vec<u8>, hash_size: usize) -> Result<u8> {
        put_uvarint(buf, self.update_index);
        match &self.value {
            RefValue::Deletion => {}
            RefValue::Direct(id) => {
                put_oid(buf, id, hash_size)?;
            }
            RefValue::Peeled { id, peeled } => {
                put_oid(buf, id, hash_size)?;
                put_oid(buf, peeled, hash_size)?;
            }
            RefValue::Symref(target) => {
                put_uvarint(buf, target.len() as u64);
                buf.put_slice(target.as_bytes());
            }
        }
        Ok(self.value_type())
    }

    fn decode(key: &[u8], extra: u8, value: &mut &[u8], hash_size: usize) -> Result<RefRecord> {
        let ref_name = utf8(key)?;
        let update_index = get_uvarint(value)?;
        let value = match extra {
            0 => RefValue::Deletion,
            1 => RefValue::Direct(take(value, hash_size)?.to_vec()),
            2 => RefValue::Peeled {
                id: take(value, hash_size)?.to_vec(),
                peeled: take(value, hash_size)?.to_vec(),
            },
            3 => {
                let len = get_uvarint(value)? as usize;
                RefValue::Symref(utf8(take(value, len)?)?)
            }
            _ => return Err(Error::Format("bad ref value type")),
        };
        Ok(RefRecord {
            ref_name,
            update_index,
            value,
        })
    }
}

/// Body of a reflog entry. `None` in [`LogRecord::value`] marks a log
/// tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogUpdate {
    pub old_id: ObjectId,
    pub new_id: ObjectId,
    pub name: String,
    pub email: String,
    pub time_seconds: u64,
    pub tz_minutes: i16,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogRecord {
    pub ref_name: String,
    pub update_index: u64,
    pub value: Option<LogUpdate>,
}

impl LogRecord {
    pub fn is_deletion(&self) -> bool {
        self.value.is_none()
    }

    /// Key layout: `ref_name || '\0' || be64(!update_index)`. Inverting the
    /// index makes lexicographic order yield the newest entry first.
    pub fn key_for(ref_name: &str, update_index: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(ref_name.len() + 9);
        key.put_slice(ref_name.as_bytes());
        key.put_u8(0);
        key.put_u64(!update_index);
        key
    }

    fn encode_value(&self, buf: &mut Vec<u8>, hash_size: usize) -> Result<u8> {
        let Some(up) = &self.value else {
            return Ok(0);
        };
        put_oid(buf, &up.old_id, hash_size)?;
        put_oid(buf, &up.new_id, hash_size)?;
        put_uvarint(buf, up.name.len() as u64);
        buf.put_slice(up.name.as_bytes());
        put_uvarint(buf, up.email.len() as u64);
        buf.put_slice(up.email.as_bytes());
        put_uvarint(buf, up.time_seconds);
        buf.put_i16(up.tz_minutes);
        put_uvarint(buf, up.message.len() as u64);
        buf.put_slice(up.message.as_bytes());
        Ok(1)
    }

    fn decode(key: &[u8], extra: u8, value: &mut &[u8], hash_size: usize) -> Result<LogRecord> {
        if key.len() < 9 || key[key.len() - 9] != 0 {
            return Err(Error::Format("malformed log key"));
        }
        let ref_name = utf8(&key[..key.len() - 9])?;
        let inverted: [u8; 8] = key[key.len() - 8..].try_into().unwrap();
        let update_index = !u64::from_be_bytes(inverted);

        let value = match extra {
            0 => None,
            1 => {
                let old_id = take(value, hash_size)?.to_vec();
                let new_id = take(value, hash_size)?.to_vec();
                let name_len = get_uvarint(value)? as usize;
                let name = utf8(take(value, name_len)?)?;
                let email_len = get_uvarint(value)? as usize;
                let email = utf8(take(value, email_len)?)?;
                let time_seconds = get_uvarint(value)?;
                let tz = take(value, 2)?;
                let tz_minutes = i16::from_be_bytes([tz[0], tz[1]]);
                let msg_len = get_uvarint(value)? as usize;
                let message = utf8(take(value, msg_len)?)?;
                Some(LogUpdate {
                    old_id,
                    new_id,
                    name,
                    email,
                    time_seconds,
                    tz_minutes,
                    message,
                })
            }
            _ => return Err(Error::Format("bad log value type")),
        };
        Ok(LogRecord {
            ref_name,
            update_index,
            value,
        })
    }
}

/// Reverse-index entry: object-id prefix → byte offsets of the ref blocks
/// whose records point at that object. An empty offsets list is the "too
/// many refs" encoding; lookups seeing it fall back to a filtering scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjRecord {
    pub hash_prefix: Vec<u8>,
    pub offsets: Vec<u64>,
}

impl ObjRecord {
    fn encode_value(&self, buf: &mut Vec<u8>) -> u8 {
        put_uvarint(buf, self.offsets.len() as u64);
        let mut prev = 0;
        for (i, &off) in self.offsets.iter().enumerate() {
            put_uvarint(buf, if i == 0 { off } else { off - prev });
            prev = off;
        }
        0
    }

    fn decode(key: &[u8], extra: u8, value: &mut &[u8]) -> Result<ObjRecord> {
        if extra != 0 {
            return Err(Error::Format("bad obj value type"));
        }
        let count = get_uvarint(value)? as usize;
        // Each offset costs at least one byte, so a sane count is bounded
        // by the bytes that are actually there.
        if count > value.len() {
            return Err(Error::Format("obj offset count exceeds value size"));
        }
        let mut offsets = Vec::with_capacity(count);
        let mut prev = 0u64;
        for i in 0..count {
            let delta = get_uvarint(value)?;
            let off = if i == 0 { delta } else { prev + delta };
            offsets.push(off);
            prev = off;
        }
        Ok(ObjRecord {
            hash_prefix: key.to_vec(),
            offsets,
        })
    }
}

/// Maps the largest key of a child block to the child's byte offset;
/// consecutive levels of these form the per-section indexes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexRecord {
    pub last_key: Vec<u8>,
    pub offset: u64,
}

impl IndexRecord {
    fn encode_value(&self, buf: &mut Vec<u8>) -> u8 {
        put_uvarint(buf, self.offset);
        0
    }

    fn decode(key: &[u8], extra: u8, value: &mut &[u8]) -> Result<IndexRecord> {
        if extra != 0 {
            return Err(Error::Format("bad index value type"));
        }
        Ok(IndexRecord {
            last_key: key.to_vec(),
            offset: get_uvarint(value)?,
        })
    }
}

/// A record of any kind; dispatch on the variant replaces the source
/// format's per-kind function tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Ref(RefRecord),
    Obj(ObjRecord),
    Log(LogRecord),
    Index(IndexRecord),
}

impl Record {
    pub fn block_type(&self) -> BlockType {
        match self {
            Record::Ref(_) => BlockType::Ref,
            Record::Obj(_) => BlockType::Obj,
            Record::Log(_) => BlockType::Log,
            Record::Index(_) => BlockType::Index,
        }
    }

    /// Derives the sort key. Heap-allocates; block and merge iterators keep
    /// the result alongside the record.
    pub fn key(&self) -> Vec<u8> {
        match self {
            Record::Ref(r) => r.ref_name.as_bytes().to_vec(),
            Record::Obj(r) => r.hash_prefix.clone(),
            Record::Log(r) => LogRecord::key_for(&r.ref_name, r.update_index),
            Record::Index(r) => r.last_key.clone(),
        }
    }

    pub fn is_deletion(&self) -> bool {
        match self {
            Record::Ref(r) => r.is_deletion(),
            Record::Log(l) => l.is_deletion(),
            Record::Obj(_) | Record::Index(_) => false,
        }
    }

    /// Appends the value bytes to `buf` and returns the value-type nibble
    /// to store in the record frame.
    pub(crate) fn encode_value(&self, buf: &mut Vec<u8>, hash_size: usize) -> Result<u8> {
        match self {
            Record::Ref(r) => r.encode_value(buf, hash_size),
            Record::Obj(r) => Ok(r.encode_value(buf)),
            Record::Log(l) => l.encode_value(buf, hash_size),
            Record::Index(i) => Ok(i.encode_value(buf)),
        }
    }

    /// Rebuilds a record of kind `typ` from its materialized key, value-type
    /// nibble and value bytes, consuming the value from the front of
    /// `value`.
    pub(crate) fn decode(
        typ: BlockType,
        key: &[u8],
        extra: u8,
        value: &mut &[u8],
        hash_size: usize,
    ) -> Result<Record> {
        Ok(match typ {
            BlockType::Ref => Record::Ref(RefRecord::decode(key, extra, value, hash_size)?),
            BlockType::Obj => Record::Obj(ObjRecord::decode(key, extra, value)?),
            BlockType::Log => Record::Log(LogRecord::decode(key, extra, value, hash_size)?),
            BlockType::Index => Record::Index(IndexRecord::decode(key, extra, value)?),
        })
    }
}

fn put_oid(buf: &mut Vec<u8>, id: &[u8], hash_size: usize) -> Result<()> {
    if id.len() != hash_size {
        return Err(Error::Api("object id has the wrong length"));
    }
    buf.put_slice(id);
    Ok(())
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::Format("name is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(byte: u8) -> ObjectId {
        vec![byte; 20]
    }

    fn round_trip(rec: &Record, hash_size: usize) -> Record {
        let mut value = Vec::new();
        let extra = rec.encode_value(&mut value, hash_size).unwrap();
        let mut rd = value.as_slice();
        let got = Record::decode(rec.block_type(), &rec.key(), extra, &mut rd, hash_size).unwrap();
        assert!(rd.is_empty(), "value bytes left over");
        got
    }

    #[test]
    fn ref_value_shapes() {
        let records = [
            RefRecord {
                ref_name: "refs/heads/main".into(),
                update_index: 7,
                value: RefValue::Direct(oid(1)),
            },
            RefRecord {
                ref_name: "refs/tags/v1".into(),
                update_index: 7,
                value: RefValue::Peeled {
                    id: oid(2),
                    peeled: oid(3),
                },
            },
            RefRecord {
                ref_name: "HEAD".into(),
                update_index: 8,
                value: RefValue::Symref("refs/heads/main".into()),
            },
            RefRecord {
                ref_name: "refs/heads/gone".into(),
                update_index: 9,
                value: RefValue::Deletion,
            },
        ];
        for rec in records {
            let rec = Record::Ref(rec);
            assert_eq!(round_trip(&rec, 20), rec);
        }
    }

    #[test]
    fn ref_deletion_flag() {
        let del = Record::Ref(RefRecord {
            ref_name: "refs/heads/x".into(),
            update_index: 1,
            value: RefValue::Deletion,
        });
        assert!(del.is_deletion());
    }

    #[test]
    fn log_round_trip() {
        let rec = Record::Log(LogRecord {
            ref_name: "refs/heads/main".into(),
            update_index: 42,
            value: Some(LogUpdate {
                old_id: oid(1),
                new_id: oid(2),
                name: "A U Thor".into(),
                email: "thor@example.com".into(),
                time_seconds: 1_700_000_000,
                tz_minutes: -120,
                message: "commit: tip\n".into(),
            }),
        });
        assert_eq!(round_trip(&rec, 20), rec);

        let tombstone = Record::Log(LogRecord {
            ref_name: "refs/heads/main".into(),
            update_index: 43,
            value: None,
        });
        assert!(tombstone.is_deletion());
        assert_eq!(round_trip(&tombstone, 20), tombstone);
    }

    #[test]
    fn log_keys_sort_newest_first() {
        let newer = LogRecord::key_for("refs/heads/main", 5);
        let older = LogRecord::key_for("refs/heads/main", 4);
        assert!(newer < older);
        // Different refs are still grouped by name.
        let other = LogRecord::key_for("refs/heads/zz", 9);
        assert!(newer < other);
    }

    #[test]
    fn obj_round_trip_and_empty_offsets() {
        let rec = Record::Obj(ObjRecord {
            hash_prefix: vec![0xab, 0xcd],
            offsets: vec![0, 4096, 12288],
        });
        assert_eq!(round_trip(&rec, 20), rec);

        let fallback = Record::Obj(ObjRecord {
            hash_prefix: vec![0xab, 0xce],
            offsets: vec![],
        });
        assert_eq!(round_trip(&fallback, 20), fallback);
    }

    #[test]
    fn index_round_trip() {
        let rec = Record::Index(IndexRecord {
            last_key: b"refs/heads/zz".to_vec(),
            offset: 1 << 30,
        });
        assert_eq!(round_trip(&rec, 20), rec);
    }
}
