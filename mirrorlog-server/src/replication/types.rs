use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};

use crate::store::StoreError;

/// Size of the master-to-slave frame header: phy offset (u64) + body size (i32).
pub const FRAME_HEADER_SIZE: usize = 12;

/// Size of the slave-to-master offset report.
pub const OFFSET_REPORT_SIZE: usize = 8;

/// Header of one push frame, big-endian on the wire.
///
/// `phy_offset` is the log offset at which `body` begins on the master. A
/// zero `body_size` marks a heartbeat frame that carries no log bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub phy_offset: u64,
    pub body_size: i32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[..8].copy_from_slice(&self.phy_offset.to_be_bytes());
        buf[8..].copy_from_slice(&self.body_size.to_be_bytes());
        buf
    }

    /// Decode a header from the start of `buf`. Returns `None` when fewer
    /// than [`FRAME_HEADER_SIZE`] bytes are available.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let phy_offset = u64::from_be_bytes(buf[..8].try_into().unwrap());
        let body_size = i32::from_be_bytes(buf[8..FRAME_HEADER_SIZE].try_into().unwrap());
        Some(Self {
            phy_offset,
            body_size,
        })
    }
}

/// A producer's wait ticket for replication past `next_offset`.
///
/// The done signal fires exactly once: `true` when some slave acknowledged
/// an offset at or past `next_offset`, `false` on timeout or shutdown.
#[derive(Debug)]
pub struct GroupCommitRequest {
    pub next_offset: u64,
    pub(crate) done: oneshot::Sender<bool>,
}

impl GroupCommitRequest {
    pub fn new(next_offset: u64) -> (Self, oneshot::Receiver<bool>) {
        let (done, rx) = oneshot::channel();
        (Self { next_offset, done }, rx)
    }

    pub(crate) fn complete(self, transfer_ok: bool) {
        // The producer may have given up waiting; a dropped receiver is fine.
        let _ = self.done.send(transfer_ok);
    }
}

/// Replication error types
#[derive(Debug, Error)]
pub enum HaError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("master pushed offset {master} but slave max offset is {slave}")]
    OffsetMismatch { slave: u64, master: u64 },

    #[error("invalid frame body size: {0}")]
    InvalidBodySize(i32),

    #[error("frame of {size} bytes exceeds read buffer capacity {capacity}")]
    FrameOversize { size: usize, capacity: usize },

    #[error("offset report not fully written")]
    ShortReport,

    #[error("invalid master address: {0}")]
    InvalidAddress(String),
}

pub type HaResult<T> = std::result::Result<T, HaError>;

/// Cooperative stop signal shared by a service loop and its owner.
///
/// Every loop in the engine checks the token each iteration and bounds its
/// waits, so shutdown completes within about one second of the signal.
#[derive(Clone, Default)]
pub struct ShutdownToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Sleep up to `timeout`, returning early when the token fires.
    pub async fn wait(&self, timeout: Duration) {
        if self.is_shutdown() {
            return;
        }
        let _ = tokio::time::timeout(timeout, self.inner.notify.notified()).await;
    }

    /// Resolve once the token fires.
    pub async fn cancelled(&self) {
        loop {
            if self.is_shutdown() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register interest before the re-check so a signal between the
            // two cannot be lost.
            notified.as_mut().enable();
            if self.is_shutdown() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_roundtrip() {
        let header = FrameHeader {
            phy_offset: 0x0102_0304_0506_0708,
            body_size: 4096,
        };
        let encoded = header.encode();
        assert_eq!(FrameHeader::decode(&encoded), Some(header));
    }

    #[test]
    fn test_frame_header_wire_layout() {
        let header = FrameHeader {
            phy_offset: 1,
            body_size: 2,
        };
        let encoded = header.encode();
        // Big-endian: offset in the first 8 bytes, size in the last 4.
        assert_eq!(&encoded[..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&encoded[8..], &[0, 0, 0, 2]);
    }

    #[test]
    fn test_frame_header_short_buffer() {
        assert_eq!(FrameHeader::decode(&[0u8; FRAME_HEADER_SIZE - 1]), None);
    }

    #[test]
    fn test_heartbeat_header() {
        let header = FrameHeader {
            phy_offset: 500,
            body_size: 0,
        };
        let decoded = FrameHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded.body_size, 0);
        assert_eq!(decoded.phy_offset, 500);
    }

    #[tokio::test]
    async fn test_group_commit_request_signals_once() {
        let (req, rx) = GroupCommitRequest::new(80);
        assert_eq!(req.next_offset, 80);
        req.complete(true);
        assert_eq!(rx.await.unwrap(), true);
    }

    #[tokio::test]
    async fn test_group_commit_request_dropped_receiver() {
        let (req, rx) = GroupCommitRequest::new(80);
        drop(rx);
        // Must not panic when the producer has gone away.
        req.complete(false);
    }

    #[tokio::test]
    async fn test_shutdown_token_wakes_waiters() {
        let token = ShutdownToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.wait(Duration::from_secs(30)).await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.shutdown();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter did not wake on shutdown")
            .unwrap();
        assert!(token.is_shutdown());
    }
}
