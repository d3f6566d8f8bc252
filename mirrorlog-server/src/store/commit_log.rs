use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

/// Storage error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("append offset gap: log max is {expected}, append at {actual}")]
    OffsetGap { expected: u64, actual: u64 },

    #[error("append conflicts with existing bytes at offset {offset}")]
    AppendConflict { offset: u64 },
}

/// The commit log as seen by the replication engine.
///
/// A physical offset is a byte position in the append-only log. The engine
/// never interprets log bytes; it only moves contiguous ranges of them.
pub trait CommitLog: Send + Sync {
    /// Current max physical offset (one past the last byte).
    fn max_offset(&self) -> u64;

    /// Append `body` at exactly `offset`.
    ///
    /// Idempotent for a contiguous re-append of identical bytes; fails on a
    /// gap or on bytes that differ from what is already stored.
    fn append_at(&self, offset: u64, body: &[u8]) -> Result<(), StoreError>;

    /// Read up to `max_len` contiguous bytes starting at `from`.
    ///
    /// Returns an empty vector when `from` is at or past the max offset.
    fn read(&self, from: u64, max_len: usize) -> Vec<u8>;
}

/// In-memory commit log.
///
/// Offsets start at 0 and grow with each append. Producers append at the
/// tail with [`MemoryCommitLog::append`]; the replication slave appends at
/// explicit offsets through the [`CommitLog`] trait.
#[derive(Default)]
pub struct MemoryCommitLog {
    data: RwLock<Vec<u8>>,
}

impl MemoryCommitLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer-side tail append. Returns the new max offset, which is the
    /// offset a producer must see replicated before its record is safe.
    pub fn append(&self, body: &[u8]) -> u64 {
        let mut data = self.data.write();
        data.extend_from_slice(body);
        data.len() as u64
    }

    /// Full copy of the log contents, for assertions.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl CommitLog for MemoryCommitLog {
    fn max_offset(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn append_at(&self, offset: u64, body: &[u8]) -> Result<(), StoreError> {
        let mut data = self.data.write();
        let max = data.len() as u64;

        if offset == max {
            data.extend_from_slice(body);
            debug!("commit log append: offset={}, len={}", offset, body.len());
            return Ok(());
        }

        // Re-append of bytes the log already holds is tolerated as long as
        // they match exactly.
        let end = offset + body.len() as u64;
        if offset < max && end <= max {
            let existing = &data[offset as usize..end as usize];
            if existing == body {
                return Ok(());
            }
            return Err(StoreError::AppendConflict { offset });
        }

        Err(StoreError::OffsetGap {
            expected: max,
            actual: offset,
        })
    }

    fn read(&self, from: u64, max_len: usize) -> Vec<u8> {
        let data = self.data.read();
        let max = data.len() as u64;
        if from >= max {
            return Vec::new();
        }
        let end = max.min(from + max_len as u64);
        data[from as usize..end as usize].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_append_advances_max() {
        let log = MemoryCommitLog::new();
        assert_eq!(log.max_offset(), 0);

        let next = log.append(b"hello");
        assert_eq!(next, 5);
        assert_eq!(log.max_offset(), 5);
        assert_eq!(log.snapshot(), b"hello");
    }

    #[test]
    fn test_append_at_contiguous() {
        let log = MemoryCommitLog::new();
        log.append_at(0, b"abc").unwrap();
        log.append_at(3, b"def").unwrap();

        assert_eq!(log.max_offset(), 6);
        assert_eq!(log.snapshot(), b"abcdef");
    }

    #[test]
    fn test_append_at_gap_rejected() {
        let log = MemoryCommitLog::new();
        log.append_at(0, b"abc").unwrap();

        let err = log.append_at(10, b"xyz").unwrap_err();
        assert!(matches!(
            err,
            StoreError::OffsetGap {
                expected: 3,
                actual: 10
            }
        ));
        assert_eq!(log.max_offset(), 3);
    }

    #[test]
    fn test_append_at_idempotent_replay() {
        let log = MemoryCommitLog::new();
        log.append_at(0, b"abcdef").unwrap();

        // Identical bytes at an already-covered offset are accepted.
        log.append_at(0, b"abc").unwrap();
        log.append_at(3, b"def").unwrap();
        assert_eq!(log.max_offset(), 6);

        // Differing bytes are not.
        let err = log.append_at(0, b"xxx").unwrap_err();
        assert!(matches!(err, StoreError::AppendConflict { offset: 0 }));
    }

    #[test]
    fn test_read_range() {
        let log = MemoryCommitLog::new();
        log.append(b"0123456789");

        assert_eq!(log.read(0, 4), b"0123");
        assert_eq!(log.read(4, 100), b"456789");
        assert_eq!(log.read(10, 4), Vec::<u8>::new());
        assert_eq!(log.read(42, 4), Vec::<u8>::new());
    }
}
