use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Closed set of failure conditions surfaced by the engine. Everything is a
/// plain value; callers match on the variant they care about.
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying read or write failed, or a read came back short.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The bytes on disk do not form a valid reftable.
    #[error("format error: {0}")]
    Format(&'static str),

    /// The caller violated an API contract (out-of-order records, wrong
    /// record kind for a section, options that contradict each other).
    #[error("api misuse: {0}")]
    Api(&'static str),

    /// The output sink refused a write because the maximum table size was
    /// reached. Soft error; the caller may start a new table.
    #[error("table out of space")]
    OutOfSpace,

    /// A file-backed block source was pointed at a path that does not exist.
    #[error("no such table: {0}")]
    NotExist(PathBuf),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
