use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::config::HaConfig;
use super::types::{FrameHeader, HaError, HaResult, ShutdownToken, FRAME_HEADER_SIZE, OFFSET_REPORT_SIZE};
use super::watermark::AckWatermark;
use crate::store::CommitLog;

/// Bounded wait used by every master-side loop iteration.
const SELECT_WAIT: Duration = Duration::from_millis(1000);

/// Poll interval while a connection's write half has nothing to push.
const TRANSFER_POLL: Duration = Duration::from_millis(100);

/// Everything a master-side task needs, shared by the acceptor and all
/// connections.
pub(crate) struct MasterContext {
    pub log: Arc<dyn CommitLog>,
    pub watermark: Arc<AckWatermark>,
    pub registry: Arc<ConnectionRegistry>,
    pub data_ready: Arc<Notify>,
    pub config: HaConfig,
}

/// Open the HA listen socket with address reuse.
pub(crate) fn bind_listener(addr: SocketAddr) -> HaResult<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

/// Accept loop: one bounded wait per pass, a connection per accepted socket.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<MasterContext>,
    token: ShutdownToken,
) {
    info!("ha acceptor started");

    while !token.is_shutdown() {
        match tokio::time::timeout(SELECT_WAIT, listener.accept()).await {
            Err(_) => continue,
            Ok(Err(e)) => warn!("accept failed: {}", e),
            Ok(Ok((stream, addr))) => {
                info!("new slave connection from {}", addr);
                match HaConnection::start(stream, addr, Arc::clone(&ctx)) {
                    Ok(conn) => ctx.registry.add(conn),
                    // The accepted socket is closed by drop; the acceptor
                    // keeps running.
                    Err(e) => error!("connection setup failed for {}: {}", addr, e),
                }
            }
        }
    }

    info!("ha acceptor stopped");
}

/// Live connections plus an externally readable count.
///
/// The count is written only while the list lock is held, so it always
/// equals the list length.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<Vec<Arc<HaConnection>>>,
    count: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn add(&self, conn: Arc<HaConnection>) {
        let mut connections = self.connections.lock();
        if self.closed.load(Ordering::Acquire) {
            // A connection accepted while destroy_all runs must not outlive it.
            drop(connections);
            conn.shutdown();
            return;
        }
        connections.push(conn);
        self.count.store(connections.len(), Ordering::Release);
    }

    /// Remove by id. Both halves of a connection call this on teardown; the
    /// second call is a no-op.
    fn remove(&self, id: u64) -> bool {
        let mut connections = self.connections.lock();
        let Some(index) = connections.iter().position(|c| c.id == id) else {
            return false;
        };
        connections.remove(index);
        self.count.store(connections.len(), Ordering::Release);
        true
    }

    /// Shut down every connection and clear the registry. No further
    /// connection survives a call to this.
    pub fn destroy_all(&self) {
        let drained: Vec<Arc<HaConnection>> = {
            let mut connections = self.connections.lock();
            self.closed.store(true, Ordering::Release);
            let drained = connections.drain(..).collect();
            self.count.store(0, Ordering::Release);
            drained
        };
        for conn in drained {
            conn.shutdown();
        }
    }
}

/// Per-slave duplex handler.
///
/// The read half consumes 8-byte offset reports and advances the ack
/// watermark; the write half pushes framed log bytes starting from the
/// offset the slave asked to resume at. Either half failing tears the whole
/// connection down.
pub struct HaConnection {
    id: u64,
    remote_addr: SocketAddr,
    /// Latest offset the slave acknowledged.
    slave_acked_offset: AtomicU64,
    /// Resume offset from the slave's first report; -1 until known.
    slave_request_offset: AtomicI64,
    token: ShutdownToken,
}

impl HaConnection {
    fn start(
        stream: TcpStream,
        remote_addr: SocketAddr,
        ctx: Arc<MasterContext>,
    ) -> HaResult<Arc<Self>> {
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let conn = Arc::new(Self {
            id: ctx.registry.next_id(),
            remote_addr,
            slave_acked_offset: AtomicU64::new(0),
            slave_request_offset: AtomicI64::new(-1),
            token: ShutdownToken::new(),
        });

        tokio::spawn(run_read(Arc::clone(&conn), read_half, Arc::clone(&ctx)));
        tokio::spawn(run_write(Arc::clone(&conn), write_half, ctx));
        Ok(conn)
    }

    pub fn shutdown(&self) {
        self.token.shutdown();
    }

    pub fn slave_acked_offset(&self) -> u64 {
        self.slave_acked_offset.load(Ordering::Acquire)
    }

    fn on_offset_report(&self, offset: u64, watermark: &AckWatermark) {
        if self.slave_request_offset.load(Ordering::Acquire) < 0 {
            self.slave_request_offset
                .store(offset as i64, Ordering::Release);
            info!(
                "slave {} requested transfer from offset {}",
                self.remote_addr, offset
            );
        }
        self.slave_acked_offset.store(offset, Ordering::Release);
        if watermark.advance_to(offset) {
            debug!("slave ack watermark advanced to {}", offset);
        }
    }

    fn teardown(&self, ctx: &MasterContext) {
        self.token.shutdown();
        if ctx.registry.remove(self.id) {
            info!("connection to slave {} closed", self.remote_addr);
        }
    }
}

async fn run_read(conn: Arc<HaConnection>, read_half: OwnedReadHalf, ctx: Arc<MasterContext>) {
    if let Err(e) = read_reports(&conn, read_half, &ctx).await {
        if !conn.token.is_shutdown() {
            warn!("slave {} read half failed: {}", conn.remote_addr, e);
        }
    }
    conn.teardown(&ctx);
}

async fn read_reports(
    conn: &HaConnection,
    mut read_half: OwnedReadHalf,
    ctx: &MasterContext,
) -> HaResult<()> {
    let housekeeping = Duration::from_millis(ctx.config.housekeeping_interval_ms);
    let mut report = [0u8; OFFSET_REPORT_SIZE];
    let mut filled = 0;
    let mut last_read = Instant::now();

    while !conn.token.is_shutdown() {
        match tokio::time::timeout(SELECT_WAIT, read_half.read(&mut report[filled..])).await {
            Err(_) => {
                if last_read.elapsed() >= housekeeping {
                    warn!(
                        "slave {} sent nothing for {:?}, expiring connection",
                        conn.remote_addr, housekeeping
                    );
                    return Ok(());
                }
            }
            Ok(Ok(0)) => return Err(HaError::ConnectionClosed),
            Ok(Ok(n)) => {
                last_read = Instant::now();
                filled += n;
                if filled == OFFSET_REPORT_SIZE {
                    filled = 0;
                    conn.on_offset_report(u64::from_be_bytes(report), &ctx.watermark);
                }
            }
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    Ok(())
}

async fn run_write(conn: Arc<HaConnection>, write_half: OwnedWriteHalf, ctx: Arc<MasterContext>) {
    if let Err(e) = push_frames(&conn, write_half, &ctx).await {
        if !conn.token.is_shutdown() {
            warn!("slave {} write half failed: {}", conn.remote_addr, e);
        }
    }
    conn.teardown(&ctx);
}

async fn push_frames(
    conn: &HaConnection,
    mut write_half: OwnedWriteHalf,
    ctx: &MasterContext,
) -> HaResult<()> {
    let heartbeat = Duration::from_millis(ctx.config.heartbeat_interval_ms);
    let batch = ctx.config.transfer_batch_bytes;

    // Push resumes from the slave's first report, never from zero.
    let mut next_transfer = loop {
        if conn.token.is_shutdown() {
            return Ok(());
        }
        let requested = conn.slave_request_offset.load(Ordering::Acquire);
        if requested >= 0 {
            break requested as u64;
        }
        conn.token.wait(TRANSFER_POLL).await;
    };

    debug!(
        "starting transfer to slave {} at offset {}",
        conn.remote_addr, next_transfer
    );
    let mut last_write = Instant::now();

    while !conn.token.is_shutdown() {
        if ctx.log.max_offset() > next_transfer {
            let body = ctx.log.read(next_transfer, batch);
            if body.is_empty() {
                conn.token.wait(TRANSFER_POLL).await;
                continue;
            }
            write_frame(conn, &mut write_half, next_transfer, &body).await?;
            next_transfer += body.len() as u64;
            last_write = Instant::now();
        } else {
            let _ = tokio::time::timeout(TRANSFER_POLL, ctx.data_ready.notified()).await;
            if last_write.elapsed() >= heartbeat {
                write_frame(conn, &mut write_half, next_transfer, &[]).await?;
                last_write = Instant::now();
            }
        }
    }
    Ok(())
}

async fn write_frame(
    conn: &HaConnection,
    write_half: &mut OwnedWriteHalf,
    phy_offset: u64,
    body: &[u8],
) -> HaResult<()> {
    let header = FrameHeader {
        phy_offset,
        body_size: body.len() as i32,
    };
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(body);

    tokio::select! {
        result = write_half.write_all(&frame) => Ok(result?),
        _ = conn.token.cancelled() => Err(HaError::ConnectionClosed),
    }
}
