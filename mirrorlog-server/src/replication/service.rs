use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

use super::config::HaConfig;
use super::group_transfer::GroupTransferService;
use super::master::{accept_loop, bind_listener, ConnectionRegistry, MasterContext};
use super::replica::HaClient;
use super::types::{GroupCommitRequest, HaResult, ShutdownToken};
use super::watermark::AckWatermark;
use crate::store::CommitLog;

/// Point-in-time view of the replication engine.
#[derive(Debug, Clone, Default)]
pub struct HaStats {
    /// Slave connections currently registered on the master side.
    pub connection_count: usize,
    /// Highest offset acknowledged by any slave.
    pub acked_offset: u64,
    /// Whether the slave-side client holds a live master connection.
    pub client_connected: bool,
    /// Last offset the slave-side client reported to its master.
    pub client_reported_offset: u64,
}

/// Replication engine facade.
///
/// Wires the master side (acceptor, per-slave connections, ack watermark,
/// producer wait queue) and the slave side (client loop) over one commit
/// log. Both sides run on every node; a node with no master address
/// configured simply leaves its client idle, and a node nobody connects to
/// keeps an empty registry.
pub struct HaService {
    config: HaConfig,
    watermark: Arc<AckWatermark>,
    registry: Arc<ConnectionRegistry>,
    transfer: Arc<GroupTransferService>,
    client: Arc<HaClient>,
    data_ready: Arc<Notify>,
    log: Arc<dyn CommitLog>,
    acceptor_token: ShutdownToken,
    listen_addr: Mutex<Option<SocketAddr>>,
}

impl HaService {
    pub fn new(config: HaConfig, log: Arc<dyn CommitLog>) -> Arc<Self> {
        let watermark = Arc::new(AckWatermark::new());
        let transfer =
            GroupTransferService::new(Arc::clone(&watermark), config.sync_flush_timeout_ms);
        let client = HaClient::new(config.clone(), Arc::clone(&log));

        Arc::new(Self {
            config,
            watermark,
            registry: Arc::new(ConnectionRegistry::new()),
            transfer,
            client,
            data_ready: Arc::new(Notify::new()),
            log,
            acceptor_token: ShutdownToken::new(),
            listen_addr: Mutex::new(None),
        })
    }

    /// Bind the HA listener and start the acceptor, group transfer, and
    /// client loops.
    pub fn start(&self) -> HaResult<()> {
        let listener = bind_listener(self.config.listen_addr)?;
        let local_addr = listener.local_addr()?;
        *self.listen_addr.lock() = Some(local_addr);
        info!("ha service listening on {}", local_addr);

        let ctx = Arc::new(MasterContext {
            log: Arc::clone(&self.log),
            watermark: Arc::clone(&self.watermark),
            registry: Arc::clone(&self.registry),
            data_ready: Arc::clone(&self.data_ready),
            config: self.config.clone(),
        });
        tokio::spawn(accept_loop(listener, ctx, self.acceptor_token.clone()));

        self.transfer.start();
        self.client.start();
        Ok(())
    }

    /// Stop the client first, then the acceptor, then every live
    /// connection, then the producer wait queue.
    pub fn shutdown(&self) {
        info!("ha service shutting down");
        self.client.shutdown();
        self.acceptor_token.shutdown();
        self.registry.destroy_all();
        self.transfer.shutdown();
    }

    /// Actual listen address, once started. Useful with an ephemeral port.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock()
    }

    /// Non-blocking enqueue of a producer replication wait.
    pub fn put_request(&self, request: GroupCommitRequest) {
        self.transfer.put_request(request);
    }

    /// A slave is considered healthy when at least one connection is live
    /// and the acked watermark is not too far behind the given master
    /// position.
    pub fn is_slave_ok(&self, master_put_where: u64) -> bool {
        self.registry.count() > 0
            && master_put_where.saturating_sub(self.watermark.current())
                < self.config.slave_fallbehind_max
    }

    /// Advance the ack watermark from outside the connection read path.
    pub fn notify_transfer_some(&self, offset: u64) {
        self.watermark.advance_to(offset);
    }

    /// Wake idle connection write halves after a producer append.
    pub fn notify_log_append(&self) {
        self.data_ready.notify_waiters();
    }

    pub fn update_master_address(&self, addr: &str) {
        self.client.update_master_address(addr);
    }

    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    pub fn acked_offset(&self) -> u64 {
        self.watermark.current()
    }

    pub fn stats(&self) -> HaStats {
        HaStats {
            connection_count: self.registry.count(),
            acked_offset: self.watermark.current(),
            client_connected: self.client.is_connected(),
            client_reported_offset: self.client.reported_offset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCommitLog;

    fn test_config() -> HaConfig {
        let mut config = HaConfig::default();
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        config
    }

    #[tokio::test]
    async fn test_start_reports_bound_address() {
        let log = Arc::new(MemoryCommitLog::new());
        let service = HaService::new(test_config(), log);

        assert!(service.listen_addr().is_none());
        service.start().unwrap();

        let addr = service.listen_addr().unwrap();
        assert_ne!(addr.port(), 0);
        service.shutdown();
    }

    #[tokio::test]
    async fn test_is_slave_ok_requires_connection() {
        let log = Arc::new(MemoryCommitLog::new());
        let service = HaService::new(test_config(), log);

        // Watermark position alone is not enough without a connection.
        service.notify_transfer_some(100);
        assert_eq!(service.acked_offset(), 100);
        assert!(!service.is_slave_ok(100));
    }

    #[tokio::test]
    async fn test_notify_transfer_some_is_monotonic() {
        let log = Arc::new(MemoryCommitLog::new());
        let service = HaService::new(test_config(), log);

        service.notify_transfer_some(100);
        service.notify_transfer_some(50);
        assert_eq!(service.acked_offset(), 100);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let log = Arc::new(MemoryCommitLog::new());
        let service = HaService::new(test_config(), log);
        service.notify_transfer_some(42);

        let stats = service.stats();
        assert_eq!(stats.connection_count, 0);
        assert_eq!(stats.acked_offset, 42);
        assert!(!stats.client_connected);
    }
}
