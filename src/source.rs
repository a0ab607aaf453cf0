//! Random-read byte sources backing a [`Table`](crate::table::Table).
//!
//! The reader borrows whole blocks as [`Bytes`]; dropping the handle gives
//! the buffer back, so every acquired block is released on every iterator
//! exit path and a second release is a no-op.

use std::fs::File;
use std::path::Path;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Capability set the reader needs from its storage. Implementations may
/// copy into fresh buffers or hand out slices of a mapping; the reader
/// never assumes either.
pub trait BlockSource {
    /// Total number of readable bytes.
    fn size(&self) -> u64;

    /// Reads exactly `len` bytes starting at `off`. Callers clip their
    /// requests to [`size`](Self::size); reading past the end is an error.
    fn read_block(&self, off: u64, len: usize) -> Result<Bytes>;
}

/// Read-only file-backed source.
#[derive(Debug)]
pub struct FileBlockSource {
    file: File,
    size: u64,
}

impl FileBlockSource {
    pub fn open(path: impl AsRef<Path>) -> Result<FileBlockSource> {
        let path = path.as_ref();
        let file = File::options().read(true).open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotExist(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        let size = file.metadata()?.len();
        Ok(FileBlockSource { file, size })
    }
}

impl BlockSource for FileBlockSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_block(&self, off: u64, len: usize) -> Result<Bytes> {
        use std::os::unix::fs::FileExt;
        let mut data = vec![0; len];
        self.file.read_exact_at(&mut data, off)?;
        Ok(Bytes::from(data))
    }
}

/// In-memory source over an immutable buffer; `read_block` is a cheap
/// refcounted slice.
#[derive(Clone, Debug)]
pub struct BytesBlockSource {
    data: Bytes,
}

impl BytesBlockSource {
    pub fn new(data: impl Into<Bytes>) -> BytesBlockSource {
        BytesBlockSource { data: data.into() }
    }
}

impl BlockSource for BytesBlockSource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_block(&self, off: u64, len: usize) -> Result<Bytes> {
        let off = off as usize;
        if off + len > self.data.len() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of table",
            )));
        }
        Ok(self.data.slice(off..off + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_source_slices() {
        let src = BytesBlockSource::new(&b"hello world"[..]);
        assert_eq!(src.size(), 11);
        assert_eq!(&src.read_block(6, 5).unwrap()[..], b"world");
        assert!(src.read_block(8, 5).is_err());
    }

    #[test]
    fn file_source_not_exist() {
        let err = FileBlockSource::open("/nonexistent/table.ref").unwrap_err();
        assert!(matches!(err, Error::NotExist(_)));
    }
}
