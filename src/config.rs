use crate::error::{Error, Result};

/// First four bytes of every table, repeated at the start of the footer.
pub const MAGIC: &[u8; 4] = b"REFT";

pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
pub const DEFAULT_RESTART_INTERVAL: u16 = 16;

/// Largest encodable block: the block length field is a u24.
pub const MAX_BLOCK_SIZE: u32 = (1 << 24) - 1;

pub const fn header_size(version: u8) -> usize {
    match version {
        1 => 24,
        _ => 28,
    }
}

pub const fn footer_size(version: u8) -> usize {
    match version {
        1 => 68,
        _ => 72,
    }
}

/// Identifies the object-id hash function shared by every table in a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashId {
    #[default]
    Sha1,
    Sha256,
}

impl HashId {
    pub const SHA1_WIRE: u32 = 0x7368_6131; // "sha1"
    pub const SHA256_WIRE: u32 = 0x7332_3536; // "s256"

    pub fn from_wire(id: u32) -> Result<HashId> {
        match id {
            Self::SHA1_WIRE => Ok(HashId::Sha1),
            Self::SHA256_WIRE => Ok(HashId::Sha256),
            _ => Err(Error::Format("unknown hash id")),
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            HashId::Sha1 => Self::SHA1_WIRE,
            HashId::Sha256 => Self::SHA256_WIRE,
        }
    }

    /// Width of an object id in bytes.
    pub fn size(self) -> usize {
        match self {
            HashId::Sha1 => 20,
            HashId::Sha256 => 32,
        }
    }
}

/// Knobs for [`TableBuilder`](crate::table::TableBuilder). Every
/// configuration item travels here; the engine keeps no global state.
#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Target block size in bytes. Ref, obj and index blocks are padded to
    /// this boundary; no uncompressed block may exceed it.
    pub block_size: u32,
    /// Every n-th record in a block is written with its full key and listed
    /// in the restart array.
    pub restart_interval: u16,
    /// Format version to emit, 1 or 2. Version 1 cannot carry a hash id and
    /// is therefore incompatible with SHA-256.
    pub hash_id: HashId,
    pub version: u8,
    /// Bounds for the update indices covered by this table. Ref records
    /// outside the range are rejected.
    pub min_update_index: u64,
    pub max_update_index: u64,
    /// Store reflog messages byte-for-byte. When unset, trailing newlines
    /// are trimmed and a single one is appended; interior newlines are
    /// rejected.
    pub exact_log_message: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            restart_interval: DEFAULT_RESTART_INTERVAL,
            hash_id: HashId::Sha1,
            version: 1,
            min_update_index: 0,
            max_update_index: 0,
            exact_log_message: false,
        }
    }
}

impl WriteOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.version != 1 && self.version != 2 {
            return Err(Error::Api("version must be 1 or 2"));
        }
        if self.version == 1 && self.hash_id == HashId::Sha256 {
            return Err(Error::Api("SHA-256 requires format version 2"));
        }
        let min = (header_size(self.version) + footer_size(self.version)) as u32;
        if self.block_size < min || self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::Api("block size out of range"));
        }
        if self.restart_interval == 0 {
            return Err(Error::Api("restart interval must be nonzero"));
        }
        if self.min_update_index > self.max_update_index {
            return Err(Error::Api("min_update_index exceeds max_update_index"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_wire_round_trip() {
        for id in [HashId::Sha1, HashId::Sha256] {
            assert_eq!(HashId::from_wire(id.to_wire()).unwrap(), id);
        }
        assert!(HashId::from_wire(0xdead_beef).is_err());
    }

    #[test]
    fn sha256_needs_v2() {
        let opts = WriteOptions {
            hash_id: HashId::Sha256,
            ..Default::default()
        };
        assert!(matches!(opts.validate(), Err(Error::Api(_))));
        let opts = WriteOptions {
            hash_id: HashId::Sha256,
            version: 2,
            ..Default::default()
        };
        assert!(opts.validate().is_ok());
    }
}
