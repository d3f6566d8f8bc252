pub mod config;
pub mod replication;
pub mod store;

// Re-export commonly used types
pub use config::{LoggingConfig, ServerConfig};
pub use replication::{
    AckWatermark, FrameHeader, GroupCommitRequest, GroupTransferService, HaClient, HaConfig,
    HaError, HaResult, HaService, HaStats,
};
pub use store::{CommitLog, MemoryCommitLog, StoreError};
