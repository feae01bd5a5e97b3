//! Threaded host integration around [`kisscore::KissEngine`]: owns the
//! reader, poller, and writer-side locking that the sans-I/O engine itself
//! knows nothing about.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{error, warn};

use kisscore::engine::validate_config;
use kisscore::queue::QueueEntry;
use kisscore::{Command, EngineConfig, EngineEvent, KissEngine, Overflow, PollingMode, SendOutcome};

use crate::error::SessionError;
use crate::transport::{SerialTransport, Transport};

/// Configuration accepted by [`Session::open`] / [`Session::with_transport`].
///
/// Immutable once the session is constructed - matches the CLI surface in
/// one-to-one fashion (`--device`, `--baud`, `--polling`, `--poll-interval`,
/// `--checksum`, `--queue-size`, `--address`).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub device: String,
    pub baud: u32,
    pub polling_mode: PollingMode,
    pub poll_interval: Duration,
    pub checksum_mode: bool,
    pub max_queue_size: usize,
    pub own_address: u8,
    pub multi_drop: bool,
    /// Addresses polled in `PollingMode::Active`. `None` defaults to 1..=15.
    pub poll_addresses: Option<Vec<u8>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            baud: 9600,
            polling_mode: PollingMode::Off,
            poll_interval: Duration::from_millis(100),
            checksum_mode: false,
            max_queue_size: 100,
            own_address: 0,
            multi_drop: false,
            poll_addresses: None,
        }
    }
}

/// The kind of non-fatal event delivered through `on_error`.
///
/// `ChecksumError`/`CrcError` mismatches are dropped silently per the
/// codec's own rules and only move a counter in [`SessionStats`] - they do
/// not reach `on_error`. Only malformed frames and transport failures do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    FrameDecodeError,
    TransportError,
}

pub type FrameHandler = dyn Fn(u8, u8, Vec<u8>) + Send + Sync;
pub type PollHandler = dyn Fn(u8) + Send + Sync;
pub type OverflowHandler = dyn Fn(u8, u8, Vec<u8>) + Send + Sync;
pub type ErrorHandler = dyn Fn(ErrorKind, String) + Send + Sync;

#[derive(Default)]
struct Handlers {
    on_frame: Option<Arc<FrameHandler>>,
    on_poll: Option<Arc<PollHandler>>,
    on_overflow: Option<Arc<OverflowHandler>>,
    on_error: Option<Arc<ErrorHandler>>,
}

/// Running totals returned by [`Session::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub crc_errors: u64,
    pub xor_errors: u64,
    pub overflows: u64,
    pub reconnects: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Started,
    Closed,
}

/// Shared state reachable from the user context, the reader thread, and the
/// poller thread. Peer state and queues sit behind `engine`'s own mutex;
/// `tx` is an independent lock so reader-initiated auto-drains don't
/// contend with a user `send()` on the engine lock while still serializing
/// every write onto the wire.
struct Inner<T: Transport> {
    engine: Mutex<KissEngine>,
    handlers: RwLock<Handlers>,
    tx: Mutex<T>,
    stop: AtomicBool,
    failed: AtomicBool,
    reconnects: AtomicU64,
    drain_tx_frames: AtomicU64,
    start: Instant,
}

impl<T: Transport> Inner<T> {
    fn now_tick(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn dispatch_frame(&self, address: u8, port: u8, payload: Vec<u8>) {
        let handler = self.handlers.read().unwrap().on_frame.clone();
        if let Some(handler) = handler {
            handler(address, port, payload);
        }
    }

    fn dispatch_poll(&self, address: u8) {
        let handler = self.handlers.read().unwrap().on_poll.clone();
        if let Some(handler) = handler {
            handler(address);
        }
    }

    fn dispatch_overflow(&self, overflow: Overflow) {
        let handler = self.handlers.read().unwrap().on_overflow.clone();
        if let Some(handler) = handler {
            handler(overflow.address, overflow.port, overflow.dropped_payload);
        }
    }

    fn dispatch_error(&self, kind: ErrorKind, detail: String) {
        let handler = self.handlers.read().unwrap().on_error.clone();
        if let Some(handler) = handler {
            handler(kind, detail);
        }
    }

    /// Write `wire` to the transport, attempting exactly one reconnect on
    /// failure. Persistent failure moves the session into the failed state.
    fn write_raw(&self, wire: &[u8]) -> Result<(), SessionError> {
        let mut tx = self.tx.lock().unwrap();
        if let Err(e) = tx.write_all(wire) {
            warn!("transport write failed: {e}; attempting one reconnect");
            self.reconnects.fetch_add(1, Ordering::Relaxed);
            if tx.reconnect().is_err() || tx.write_all(wire).is_err() {
                error!("transport write failed after reconnect attempt; session has failed");
                self.failed.store(true, Ordering::SeqCst);
                let err = SessionError::from(e);
                self.dispatch_error(ErrorKind::TransportError, err.to_string());
                return Err(err);
            }
        }
        Ok(())
    }

    /// Transmit a frame the engine already counted in its own `tx_frames`
    /// (an immediate `send()` in off/active mode, or a scheduled POLL).
    fn transmit_immediate(&self, wire: &[u8]) -> Result<(), SessionError> {
        self.write_raw(wire)
    }

    /// Transmit a frame drained from a port queue. These never passed
    /// through `KissEngine::send`'s immediate-transmit path, so they are
    /// counted here instead.
    fn transmit_drained(&self, wire: &[u8]) -> Result<(), SessionError> {
        self.write_raw(wire)?;
        self.drain_tx_frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drain every port queue for `address` and transmit each entry in
    /// FIFO order. On a transmit failure, the untransmitted tail - the
    /// failed entry plus everything behind it - is re-queued at the head
    /// of its port so order is preserved for the next attempt.
    fn drain_and_transmit(&self, address: u8) -> Result<(), SessionError> {
        let drained = self.engine.lock().unwrap().drain_queues_for(address);

        let mut by_port: Vec<(u8, Vec<QueueEntry>)> = Vec::new();
        for (port, entry) in drained {
            match by_port.last_mut() {
                Some((p, entries)) if *p == port => entries.push(entry),
                _ => by_port.push((port, vec![entry])),
            }
        }

        for (port, mut entries) in by_port {
            while !entries.is_empty() {
                let entry = entries.remove(0);
                let wire = self
                    .engine
                    .lock()
                    .unwrap()
                    .encode_drained_entry(address, port, &entry)?;
                if let Err(e) = self.transmit_drained(&wire) {
                    entries.insert(0, entry);
                    self.engine.lock().unwrap().requeue(address, port, entries);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn handle_rx_bytes(&self, buf: &[u8]) {
        let events = self.engine.lock().unwrap().handle_rx_bytes(buf);
        for event in events {
            match event {
                EngineEvent::Frame {
                    address,
                    port,
                    payload,
                } => self.dispatch_frame(address, port, payload),
                EngineEvent::Poll { address } => {
                    self.dispatch_poll(address);
                    let should_drain = self.engine.lock().unwrap().should_drain_on_poll(address);
                    if should_drain {
                        if let Err(e) = self.drain_and_transmit(address) {
                            warn!("passive auto-drain for address {address} aborted: {e}");
                        }
                    }
                }
                EngineEvent::DecodeError => {
                    self.dispatch_error(ErrorKind::FrameDecodeError, "malformed KISS frame".into())
                }
            }
        }
    }

    fn send(&self, address: u8, port: u8, payload: &[u8]) -> Result<(), SessionError> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(SessionError::Failed);
        }
        let now = self.now_tick();
        let (outcome, overflow) = self
            .engine
            .lock()
            .unwrap()
            .send(address, port, payload, now)?;
        if let Some(overflow) = overflow {
            self.dispatch_overflow(overflow);
        }
        match outcome {
            SendOutcome::Transmit(wire) => self.transmit_immediate(&wire),
            SendOutcome::Queued => Ok(()),
        }
    }

    fn send_command(&self, port_or_address: u8, command: Command, payload: &[u8]) -> Result<(), SessionError> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(SessionError::Failed);
        }
        let wire = self
            .engine
            .lock()
            .unwrap()
            .send_command(port_or_address, command, payload)?;
        self.transmit_immediate(&wire)
    }
}

/// A live KISS/XKISS/SMACK session against one transport.
///
/// Owns up to two background threads: a reader that feeds inbound bytes to
/// the engine and dispatches the resulting events, and (in
/// [`PollingMode::Active`]) a poller that emits scheduled `POLL` frames.
/// `send`/`poll`/`close` and callback registration are called from the
/// user's own thread.
pub struct Session<T: Transport> {
    inner: Arc<Inner<T>>,
    own_address: u8,
    lifecycle: Mutex<Lifecycle>,
    shutdown_timeout: Duration,
    reader_handle: Option<JoinHandle<()>>,
    reader_done: mpsc::Receiver<()>,
    poller_handle: Option<JoinHandle<()>>,
    poller_done: Option<mpsc::Receiver<()>>,
}

impl Session<SerialTransport> {
    /// Open a session against a local serial port, per `config.device`/`baud`.
    pub fn open(config: SessionConfig) -> Result<Self, SessionError> {
        let transport = SerialTransport::open(&config.device, config.baud)?;
        Self::with_transport(transport, config)
    }
}

impl<T: Transport> Session<T> {
    /// Open a session against an already-constructed transport. The
    /// generic entry point; `Session::open` is the serial-port convenience
    /// built on top of it, and tests use it with an in-memory loopback.
    pub fn with_transport(mut transport: T, config: SessionConfig) -> Result<Self, SessionError> {
        let poll_interval_ticks = (config.poll_interval.as_millis() as u64).max(1);
        validate_config(poll_interval_ticks, config.max_queue_size, config.own_address)
            .map_err(|_| {
                SessionError::InvalidConfig(
                    "poll_interval must be > 0, max_queue_size must be >= 1, and own_address must be 0..=15"
                        .to_string(),
                )
            })?;
        if config.poll_interval.is_zero() {
            return Err(SessionError::InvalidConfig(
                "poll_interval must be greater than zero".to_string(),
            ));
        }

        let write_half = transport.try_clone()?;
        let engine_config = EngineConfig {
            polling_mode: config.polling_mode,
            poll_interval_ticks,
            xor_on_transmit: config.checksum_mode,
            max_queue_size: config.max_queue_size,
            own_address: config.own_address,
            multi_drop: config.multi_drop,
            poll_addresses: config.poll_addresses.clone().unwrap_or_else(|| (1..=15).collect()),
        };

        let inner = Arc::new(Inner {
            engine: Mutex::new(KissEngine::new(engine_config)),
            handlers: RwLock::new(Handlers::default()),
            tx: Mutex::new(write_half),
            stop: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            reconnects: AtomicU64::new(0),
            drain_tx_frames: AtomicU64::new(0),
            start: Instant::now(),
        });

        let (reader_done_tx, reader_done) = mpsc::sync_channel(1);
        let reader_handle = Some(spawn_reader(transport, inner.clone(), reader_done_tx));

        let (poller_handle, poller_done) = if config.polling_mode == PollingMode::Active {
            let (done_tx, done_rx) = mpsc::sync_channel(1);
            (
                Some(spawn_poller(inner.clone(), config.poll_interval, done_tx)),
                Some(done_rx),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            inner,
            own_address: config.own_address,
            lifecycle: Mutex::new(Lifecycle::Started),
            shutdown_timeout: config.poll_interval * 2,
            reader_handle,
            reader_done,
            poller_handle,
            poller_done,
        })
    }

    pub fn set_on_frame<F: Fn(u8, u8, Vec<u8>) + Send + Sync + 'static>(&self, handler: F) {
        self.inner.handlers.write().unwrap().on_frame = Some(Arc::new(handler));
    }

    pub fn set_on_poll<F: Fn(u8) + Send + Sync + 'static>(&self, handler: F) {
        self.inner.handlers.write().unwrap().on_poll = Some(Arc::new(handler));
    }

    pub fn set_on_overflow<F: Fn(u8, u8, Vec<u8>) + Send + Sync + 'static>(&self, handler: F) {
        self.inner.handlers.write().unwrap().on_overflow = Some(Arc::new(handler));
    }

    pub fn set_on_error<F: Fn(ErrorKind, String) + Send + Sync + 'static>(&self, handler: F) {
        self.inner.handlers.write().unwrap().on_error = Some(Arc::new(handler));
    }

    /// Transmit `payload` to `address` on `port`. In `Off`/`Active` mode
    /// this writes immediately; in `Passive` mode it is buffered until the
    /// next inbound `POLL` for `address`, or a manual [`Session::poll`].
    pub fn send(&self, address: u8, port: u8, payload: &[u8]) -> Result<(), SessionError> {
        self.inner.send(address, port, payload)
    }

    /// Transmit `payload` on `port` addressed to this session's own address.
    pub fn send_default(&self, port: u8, payload: &[u8]) -> Result<(), SessionError> {
        self.send(self.own_address, port, payload)
    }

    /// Send a host-to-TNC configuration command (TX_DELAY, PERSISTENCE,
    /// SLOT_TIME, TX_TAIL, FULL_DUPLEX, SET_HARDWARE, RETURN) addressed to
    /// `port_or_address`. Always transmits immediately and plain - config
    /// commands are never SMACK/XOR-checksummed and never sit in a port
    /// queue, regardless of `polling_mode` - since they configure the
    /// locally attached TNC rather than deliver data to a bus peer.
    ///
    /// `command` must not be `Command::Data` or `Command::Poll`; either
    /// fails with `SessionError::Protocol(KissError::InvalidCommand)` - use
    /// `send()` for DATA and the active poller / `poll()` for POLL.
    pub fn send_command(&self, port_or_address: u8, command: Command, payload: &[u8]) -> Result<(), SessionError> {
        self.inner.send_command(port_or_address, command, payload)
    }

    /// Force a drain of every port queue for this session's own address, as
    /// though an inbound `POLL` had just arrived. Works in every polling
    /// mode, not only `Passive`.
    pub fn poll(&self) -> Result<(), SessionError> {
        self.inner.drain_and_transmit(self.own_address)
    }

    pub fn stats(&self) -> SessionStats {
        let engine_stats = self.inner.engine.lock().unwrap().stats();
        SessionStats {
            tx_frames: engine_stats.tx_frames + self.inner.drain_tx_frames.load(Ordering::Relaxed),
            rx_frames: engine_stats.rx_frames,
            crc_errors: engine_stats.crc_errors,
            xor_errors: engine_stats.xor_errors,
            overflows: engine_stats.overflows,
            reconnects: self.inner.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Stop the reader/poller threads, discard any buffered passive-mode
    /// payloads, and close the transport. Idempotent: a second call returns
    /// `Ok(())` without touching anything.
    pub fn close(&mut self) -> Result<(), SessionError> {
        let mut lifecycle = self.lifecycle.lock().unwrap();
        if *lifecycle == Lifecycle::Closed {
            return Ok(());
        }
        *lifecycle = Lifecycle::Closed;
        drop(lifecycle);

        self.inner.stop.store(true, Ordering::SeqCst);
        let discarded = self.inner.engine.lock().unwrap().discard_all_queues();
        if discarded > 0 {
            warn!("discarding {discarded} buffered passive-mode payload(s) on close");
        }
        let _ = self.inner.tx.lock().unwrap().close();

        if self.reader_done.recv_timeout(self.shutdown_timeout).is_ok() {
            if let Some(handle) = self.reader_handle.take() {
                let _ = handle.join();
            }
        } else {
            warn!("reader thread did not stop within the shutdown timeout");
        }
        if let Some(done) = &self.poller_done {
            if done.recv_timeout(self.shutdown_timeout).is_ok() {
                if let Some(handle) = self.poller_handle.take() {
                    let _ = handle.join();
                }
            } else {
                warn!("poller thread did not stop within the shutdown timeout");
            }
        }
        Ok(())
    }
}

fn spawn_reader<T: Transport>(
    mut read_half: T,
    inner: Arc<Inner<T>>,
    done: mpsc::SyncSender<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        while !inner.stop.load(Ordering::SeqCst) {
            match read_half.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => inner.handle_rx_bytes(&buf[..n]),
                Err(e) => {
                    error!("transport read failed: {e}; attempting one reconnect");
                    inner.reconnects.fetch_add(1, Ordering::Relaxed);
                    if read_half.reconnect().is_err() {
                        error!("reconnect failed; reader thread terminating, session has failed");
                        inner.failed.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
        let _ = done.send(());
    })
}

fn spawn_poller<T: Transport>(
    inner: Arc<Inner<T>>,
    poll_interval: Duration,
    done: mpsc::SyncSender<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let step = poll_interval.min(Duration::from_millis(50)).max(Duration::from_millis(1));
        while !inner.stop.load(Ordering::SeqCst) {
            let now = inner.now_tick();
            let frames = inner.engine.lock().unwrap().poll_tick(now);
            for wire in frames {
                if let Err(e) = inner.transmit_immediate(&wire) {
                    warn!("failed to transmit scheduled poll: {e}");
                }
            }
            thread::sleep(step);
        }
        let _ = done.send(());
    })
}
