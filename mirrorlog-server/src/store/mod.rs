/// Commit log storage layer
///
/// The replication engine treats storage as a narrow interface: current max
/// physical offset, append-at-offset, and a contiguous range read for the
/// master-side push. `MemoryCommitLog` is the in-process implementation used
/// by the server binary and the test suite.
pub mod commit_log;

pub use commit_log::{CommitLog, MemoryCommitLog, StoreError};
