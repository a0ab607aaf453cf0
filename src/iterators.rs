pub mod merge_iterator;

use crate::error::{Error, Result};
use crate::record::{LogRecord, Record, RefRecord};

/// Streaming access to sorted records. Implementations hand ownership of
/// each record to the caller; after `Ok(None)` the iterator stays
/// exhausted.
pub trait RecordIterator {
    fn next_record(&mut self) -> Result<Option<Record>>;
}

/// Adapts a record stream known to contain ref records into a typed
/// iterator.
pub struct RefIterator<I> {
    inner: I,
}

impl<I> RefIterator<I> {
    pub(crate) fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<I: RecordIterator> Iterator for RefIterator<I> {
    type Item = Result<RefRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next_record() {
            Ok(Some(Record::Ref(rec))) => Some(Ok(rec)),
            Ok(Some(_)) => Some(Err(Error::Format("ref stream yielded a foreign record"))),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Adapts a record stream known to contain log records into a typed
/// iterator.
pub struct LogIterator<I> {
    inner: I,
}

impl<I> LogIterator<I> {
    pub(crate) fn new(inner: I) -> Self {
        Self { inner }
    }
}

impl<I: RecordIterator> Iterator for LogIterator<I> {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.inner.next_record() {
            Ok(Some(Record::Log(rec))) => Some(Ok(rec)),
            Ok(Some(_)) => Some(Err(Error::Format("log stream yielded a foreign record"))),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
