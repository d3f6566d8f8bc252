/// Replication module - master/slave streaming of the append-only commit log
///
/// Design:
/// - The master accepts slave connections and pushes newly committed log
///   bytes to each as framed batches.
/// - Each slave keeps one connection to its master, appends pushed frames to
///   its local log, and acknowledges progress with 8-byte offset reports.
/// - An ack watermark tracks the furthest offset any slave confirmed; the
///   group transfer service parks producers until the watermark passes their
///   record or a bounded timeout elapses.
///
/// Features:
/// - Resume from the slave's reported offset on every (re)connect
/// - Heartbeats in both directions with bounded quiet-time teardown
/// - Strict offset contiguity checking (a mismatched push is fatal)
/// - Bounded waits everywhere, so shutdown completes promptly
pub mod config;
pub mod group_transfer;
pub mod master;
pub mod replica;
pub mod service;
pub mod types;
pub mod watermark;

pub use config::HaConfig;
pub use group_transfer::GroupTransferService;
pub use master::ConnectionRegistry;
pub use replica::HaClient;
pub use service::{HaService, HaStats};
pub use types::{FrameHeader, GroupCommitRequest, HaError, HaResult, ShutdownToken};
pub use watermark::AckWatermark;
