use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use super::config::HaConfig;
use super::types::{
    FrameHeader, HaError, HaResult, ShutdownToken, FRAME_HEADER_SIZE, OFFSET_REPORT_SIZE,
};
use crate::store::CommitLog;

/// Socket read buffer size, shared by the primary and spare buffers.
const READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded readiness wait per loop pass.
const SELECT_WAIT: Duration = Duration::from_millis(1000);

/// Consecutive would-block reads before the drain gives up for this pass.
const MAX_IDLE_READS: u32 = 3;

/// Slave-side client loop.
///
/// Connects to the configured master, reports the local log's max offset,
/// decodes pushed frames into the local log, and re-reports progress. Any
/// I/O failure or protocol violation tears the connection down; the loop
/// then reconnects after a backoff and resumes from the on-disk max offset.
pub struct HaClient {
    config: HaConfig,
    log: Arc<dyn CommitLog>,
    master_address: RwLock<Option<String>>,
    connected: AtomicBool,
    reported_offset: AtomicU64,
    token: ShutdownToken,
}

/// Connection state owned exclusively by the client task.
struct ClientState {
    socket: Option<TcpStream>,
    /// Inbound bytes land here; `dispatch_pos..write_pos` is undecoded.
    primary: Vec<u8>,
    /// Swap target for compaction.
    spare: Vec<u8>,
    write_pos: usize,
    dispatch_pos: usize,
    /// Highest offset already reported to the master.
    current_reported: u64,
    last_write: Instant,
    last_read: Instant,
    /// Forces a report on the next pass regardless of elapsed time.
    heartbeat_due: bool,
}

impl ClientState {
    fn new() -> Self {
        Self {
            socket: None,
            primary: vec![0u8; READ_BUFFER_SIZE],
            spare: vec![0u8; READ_BUFFER_SIZE],
            write_pos: 0,
            dispatch_pos: 0,
            current_reported: 0,
            last_write: Instant::now(),
            last_read: Instant::now(),
            heartbeat_due: true,
        }
    }
}

impl HaClient {
    pub fn new(config: HaConfig, log: Arc<dyn CommitLog>) -> Arc<Self> {
        let master_address = RwLock::new(config.master_address.clone());
        Arc::new(Self {
            config,
            log,
            master_address,
            connected: AtomicBool::new(false),
            reported_offset: AtomicU64::new(0),
            token: ShutdownToken::new(),
        })
    }

    pub fn start(self: &Arc<Self>) {
        let client = Arc::clone(self);
        tokio::spawn(client.run());
    }

    pub fn shutdown(&self) {
        self.token.shutdown();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Last offset reported to the master.
    pub fn reported_offset(&self) -> u64 {
        self.reported_offset.load(Ordering::Acquire)
    }

    /// Set the master address. An existing connection is left alone; the
    /// next reconnect uses the new address.
    pub fn update_master_address(&self, new_addr: &str) {
        let mut current = self.master_address.write();
        if current.as_deref() != Some(new_addr) {
            info!(
                "update master address, old: {:?}, new: {}",
                current.as_deref(),
                new_addr
            );
            *current = Some(new_addr.to_string());
        }
    }

    pub fn master_address(&self) -> Option<String> {
        self.master_address.read().clone()
    }

    async fn run(self: Arc<Self>) {
        info!("ha client started");

        let heartbeat = Duration::from_millis(self.config.heartbeat_interval_ms);
        let housekeeping = Duration::from_millis(self.config.housekeeping_interval_ms);
        let reconnect = Duration::from_millis(self.config.reconnect_delay_ms);
        let mut state = ClientState::new();

        while !self.token.is_shutdown() {
            if !self.connect_master(&mut state).await {
                self.token.wait(reconnect).await;
                continue;
            }

            match self.transfer_pass(&mut state, heartbeat).await {
                Ok(()) => {
                    if state.last_read.elapsed() >= housekeeping {
                        warn!(
                            "master {:?} not responding for {:?}, closing connection",
                            self.master_address(),
                            housekeeping
                        );
                        self.close_master(&mut state);
                    }
                }
                Err(e) => {
                    if !self.token.is_shutdown() {
                        warn!("ha client connection failed: {}", e);
                    }
                    self.close_master(&mut state);
                }
            }
        }

        self.close_master(&mut state);
        info!("ha client stopped");
    }

    /// One loop pass: heartbeat report, bounded readiness wait, drain and
    /// dispatch, progress report.
    async fn transfer_pass(&self, state: &mut ClientState, heartbeat: Duration) -> HaResult<()> {
        if state.heartbeat_due || state.last_write.elapsed() >= heartbeat {
            let reported = state.current_reported;
            self.report_slave_max_offset(state, reported)?;
        }

        {
            let socket = state.socket.as_ref().ok_or(HaError::ConnectionClosed)?;
            match tokio::time::timeout(SELECT_WAIT, socket.readable()).await {
                Err(_) => {}
                Ok(readable) => readable?,
            }
        }

        self.process_read_event(state)?;
        self.report_max_offset_plus(state)?;
        Ok(())
    }

    /// Attempt a connection when none exists. Returns whether a socket is
    /// now available.
    async fn connect_master(&self, state: &mut ClientState) -> bool {
        if state.socket.is_some() {
            return true;
        }

        let Some(addr_text) = self.master_address.read().clone() else {
            return false;
        };
        let addr: SocketAddr = match addr_text.parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!("{}", HaError::InvalidAddress(addr_text));
                return false;
            }
        };

        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(socket)) => {
                if let Err(e) = socket.set_nodelay(true) {
                    warn!("set_nodelay on master connection failed: {}", e);
                }
                info!("connected to master {}", addr);
                state.socket = Some(socket);
                self.connected.store(true, Ordering::SeqCst);
            }
            Ok(Err(e)) => {
                warn!("connect to master {} failed: {}", addr, e);
                return false;
            }
            Err(_) => {
                warn!("connect to master {} timed out", addr);
                return false;
            }
        }

        state.current_reported = self.log.max_offset();
        state.last_write = Instant::now();
        state.last_read = Instant::now();
        true
    }

    fn close_master(&self, state: &mut ClientState) {
        if state.socket.take().is_some() {
            info!("closed connection to master {:?}", self.master_address());
        }
        self.connected.store(false, Ordering::SeqCst);
        state.dispatch_pos = 0;
        state.write_pos = 0;
        state.heartbeat_due = true;
    }

    /// Send one 8-byte big-endian offset report.
    fn report_slave_max_offset(&self, state: &mut ClientState, max_offset: u64) -> HaResult<()> {
        let socket = state.socket.as_ref().ok_or(HaError::ConnectionClosed)?;
        let report = max_offset.to_be_bytes();

        let mut written = 0;
        for _ in 0..3 {
            if written == OFFSET_REPORT_SIZE {
                break;
            }
            match socket.try_write(&report[written..]) {
                Ok(n) => written += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if written < OFFSET_REPORT_SIZE {
            // A torn report would desynchronize the master's read side.
            return Err(HaError::ShortReport);
        }

        state.last_write = Instant::now();
        state.heartbeat_due = false;
        self.reported_offset.store(max_offset, Ordering::Release);
        debug!("reported slave max offset {}", max_offset);
        Ok(())
    }

    /// Drain the socket without blocking. A would-block read plays the part
    /// of a zero-length read: three in a row end the drain for this pass.
    fn process_read_event(&self, state: &mut ClientState) -> HaResult<()> {
        let mut idle_reads = 0;
        while state.write_pos < state.primary.len() {
            let result = {
                let ClientState {
                    socket,
                    primary,
                    write_pos,
                    ..
                } = &mut *state;
                let Some(socket) = socket.as_ref() else {
                    return Err(HaError::ConnectionClosed);
                };
                socket.try_read(&mut primary[*write_pos..])
            };

            match result {
                Ok(0) => return Err(HaError::ConnectionClosed),
                Ok(n) => {
                    idle_reads = 0;
                    state.write_pos += n;
                    state.last_read = Instant::now();
                    self.dispatch_read(state)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    idle_reads += 1;
                    if idle_reads >= MAX_IDLE_READS {
                        break;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Decode and apply every whole frame in the undecoded window.
    fn dispatch_read(&self, state: &mut ClientState) -> HaResult<()> {
        loop {
            let available = state.write_pos - state.dispatch_pos;
            if available >= FRAME_HEADER_SIZE {
                let Some(header) =
                    FrameHeader::decode(&state.primary[state.dispatch_pos..state.write_pos])
                else {
                    break;
                };

                if header.body_size < 0 {
                    return Err(HaError::InvalidBodySize(header.body_size));
                }
                let body_size = header.body_size as usize;
                let frame_len = FRAME_HEADER_SIZE + body_size;
                if frame_len > state.primary.len() {
                    return Err(HaError::FrameOversize {
                        size: frame_len,
                        capacity: state.primary.len(),
                    });
                }

                let local_max = self.log.max_offset();
                if local_max != 0 && header.phy_offset != local_max {
                    error!(
                        "master pushed offset {} but slave max offset is {}",
                        header.phy_offset, local_max
                    );
                    return Err(HaError::OffsetMismatch {
                        slave: local_max,
                        master: header.phy_offset,
                    });
                }

                if available >= frame_len {
                    if body_size > 0 {
                        let body_start = state.dispatch_pos + FRAME_HEADER_SIZE;
                        let body = &state.primary[body_start..body_start + body_size];
                        self.log.append_at(header.phy_offset, body)?;
                    }
                    state.dispatch_pos += frame_len;
                    self.report_max_offset_plus(state)?;
                    continue;
                }
            }

            if state.write_pos == state.primary.len() {
                compact_buffers(state);
            }
            break;
        }
        Ok(())
    }

    /// Report fresh progress whenever the local log grew past the last
    /// reported offset.
    fn report_max_offset_plus(&self, state: &mut ClientState) -> HaResult<()> {
        let current_max = self.log.max_offset();
        if current_max > state.current_reported {
            state.current_reported = current_max;
            if let Err(e) = self.report_slave_max_offset(state, current_max) {
                error!("progress report at offset {} failed: {}", current_max, e);
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Move the undecoded tail to the front via the spare buffer and swap.
/// No undecoded byte is lost and no reallocation happens.
fn compact_buffers(state: &mut ClientState) {
    let ClientState {
        primary,
        spare,
        write_pos,
        dispatch_pos,
        ..
    } = state;

    let remaining = *write_pos - *dispatch_pos;
    if remaining > 0 {
        spare[..remaining].copy_from_slice(&primary[*dispatch_pos..*write_pos]);
    }
    std::mem::swap(primary, spare);
    *write_pos = remaining;
    *dispatch_pos = 0;
}
