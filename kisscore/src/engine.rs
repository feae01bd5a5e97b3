//! Sans-I/O polling engine: peer SMACK state, per-port queues, and the
//! active/passive/off polling state machine.
//!
//! Nothing in this module touches a socket, a file descriptor, or a thread.
//! Inbound bytes are pushed in via [`KissEngine::handle_rx_bytes`]; time is
//! pushed in via [`KissEngine::poll_tick`]; everything the host needs to
//! transmit comes back as plain `Vec<u8>` wire frames for the caller to hand
//! to its own transport.

use crate::address;
use crate::command::Command;
use crate::crc;
use crate::error::KissError;
use crate::frame::{decode_frame, encode_frame, ChecksumMode};
use crate::kiss::KissBuffer;
use crate::queue::{PortQueue, QueueEntry};

/// How the engine drives transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingMode {
    /// No synthesized polling. `send()` transmits immediately.
    Off,
    /// Host is bus master: periodically emits POLL to each configured address.
    Active,
    /// Host is a bus slave: buffers `send()` until polled by the master.
    Passive,
}

/// Immutable-after-construction engine configuration: the subset of a
/// session's configuration that governs protocol behavior, as opposed to
/// I/O - the transport locator lives one layer up in `kissapp`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub polling_mode: PollingMode,
    /// Ticks between active polls. Units are whatever the caller's clock
    /// uses; `kissapp` maps this onto `poll_interval` milliseconds.
    pub poll_interval_ticks: u64,
    /// Enable XOR checksum on transmit, when SMACK has not already taken over.
    pub xor_on_transmit: bool,
    /// Per-port queue capacity.
    pub max_queue_size: usize,
    /// This host's address in multi-drop deployments.
    pub own_address: u8,
    /// If true, the type byte's high nibble is the XKISS TNC address and
    /// DATA frames use port 0; if false (plain KISS) it is the port number.
    pub multi_drop: bool,
    /// Addresses actively polled in `PollingMode::Active`.
    pub poll_addresses: Vec<u8>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            polling_mode: PollingMode::Off,
            poll_interval_ticks: 100,
            xor_on_transmit: false,
            max_queue_size: 100,
            own_address: 0,
            multi_drop: false,
            poll_addresses: (1..=15).collect(),
        }
    }
}

/// Per-peer-address state.
#[derive(Debug)]
struct PeerState {
    smack_enabled: bool,
    queues: [Option<PortQueue>; 16],
}

impl PeerState {
    fn new() -> Self {
        Self {
            smack_enabled: false,
            queues: Default::default(),
        }
    }

    fn queue_mut(&mut self, port: u8, capacity: usize) -> &mut PortQueue {
        self.queues[port as usize].get_or_insert_with(|| PortQueue::new(capacity))
    }
}

/// Running totals surfaced through `session.stats()`. The transport-level
/// `reconnects` counter is tracked one layer up in `kissapp`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub tx_frames: u64,
    pub rx_frames: u64,
    pub crc_errors: u64,
    pub xor_errors: u64,
    pub overflows: u64,
    pub decode_errors: u64,
}

/// An overflow that occurred while enqueueing a passive-mode payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overflow {
    pub address: u8,
    pub port: u8,
    pub dropped_payload: Vec<u8>,
}

/// Result of [`KissEngine::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Off/active mode: transmit this wire frame now.
    Transmit(Vec<u8>),
    /// Passive mode: buffered, nothing to send until polled.
    Queued,
}

/// Events produced while feeding inbound bytes to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A valid DATA frame addressed to us.
    Frame { address: u8, port: u8, payload: Vec<u8> },
    /// A valid POLL frame.
    Poll { address: u8 },
    /// A non-fatal frame decode error (malformed escape, truncated frame).
    /// CRC/XOR mismatches are not reported here - they are dropped silently
    /// silently, only incrementing `EngineStats`.
    DecodeError,
}

pub struct KissEngine {
    config: EngineConfig,
    peers: [PeerState; 16],
    rx_buffer: KissBuffer,
    stats: EngineStats,
    next_poll_due: Option<u64>,
}

impl KissEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            peers: std::array::from_fn(|_| PeerState::new()),
            rx_buffer: KissBuffer::new(),
            stats: EngineStats::default(),
            next_poll_due: None,
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    fn checksum_mode_for(&self, address: u8) -> ChecksumMode {
        if self.peers[address as usize].smack_enabled {
            ChecksumMode::Smack
        } else if self.config.xor_on_transmit {
            ChecksumMode::Xor
        } else {
            ChecksumMode::Plain
        }
    }

    fn header_nibble(&self, address: u8, port: u8) -> u8 {
        if self.config.multi_drop {
            address
        } else {
            port
        }
    }

    fn encode_data_frame(&self, address: u8, port: u8, payload: &[u8]) -> Result<Vec<u8>, KissError> {
        let nibble_address = self.header_nibble(address, port);
        let mode = self.checksum_mode_for(address);
        encode_frame(nibble_address, Command::Data, payload, mode)
    }

    /// Submit a payload for transmission to `address` on `port`.
    ///
    /// In `Off`/`Active` mode this returns the wire frame to transmit now.
    /// In `Passive` mode the payload is buffered; an `Overflow` is returned
    /// alongside if that push dropped an older entry.
    pub fn send(
        &mut self,
        address: u8,
        port: u8,
        payload: &[u8],
        now_tick: u64,
    ) -> Result<(SendOutcome, Option<Overflow>), KissError> {
        if address > 0x0F || port > 0x0F {
            return Err(KissError::InvalidAddress);
        }
        match self.config.polling_mode {
            PollingMode::Passive => {
                let entry = QueueEntry {
                    port,
                    payload: payload.to_vec(),
                    enqueue_tick: now_tick,
                };
                let capacity = self.config.max_queue_size;
                let queue = self.peers[address as usize].queue_mut(port, capacity);
                let overflow = queue.enqueue(entry).map(|dropped| {
                    self.stats.overflows += 1;
                    Overflow {
                        address,
                        port,
                        dropped_payload: dropped.payload,
                    }
                });
                Ok((SendOutcome::Queued, overflow))
            }
            PollingMode::Off | PollingMode::Active => {
                let wire = self.encode_data_frame(address, port, payload)?;
                self.stats.tx_frames += 1;
                Ok((SendOutcome::Transmit(wire), None))
            }
        }
    }

    /// Feed bytes freshly read from the transport. Returns events to dispatch
    /// and, via [`KissEngine::take_poll_response`], any outbound DATA frames
    /// synthesized by draining a queue in response to an inbound POLL.
    pub fn handle_rx_bytes(&mut self, mut buf: &[u8]) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while !buf.is_empty() {
            let remaining = self.rx_buffer.buf_remaining();
            if remaining.is_empty() {
                log::warn!("kiss rx buffer full without a terminating FEND, resyncing");
                self.rx_buffer.resync();
                continue;
            }
            let n = buf.len().min(remaining.len());
            remaining[..n].copy_from_slice(&buf[..n]);
            self.rx_buffer.did_write(n);
            buf = &buf[n..];

            while let Some(raw) = self.rx_buffer.next_frame() {
                self.decode_and_handle(raw.as_bytes(), &mut events);
            }
        }
        events
    }

    fn decode_and_handle(&mut self, raw: &[u8], events: &mut Vec<EngineEvent>) {
        let xor_enabled = self.config.xor_on_transmit;
        match decode_frame(raw, xor_enabled) {
            Ok(frame) => {
                self.stats.rx_frames += 1;
                // Resolve the wire nibble into the same (peer address, port)
                // pair `send()`/`checksum_mode_for` use, *before* touching
                // peer state: in pure-KISS mode (`multi_drop == false`) the
                // high nibble is a port, not a peer address, so the only
                // addressable peer is `own_address` - the SMACK flag must be
                // recorded under that same key or TX-side lookups never see it.
                let (address, port) = if self.config.multi_drop {
                    (frame.address, 0)
                } else {
                    (self.config.own_address, frame.address)
                };
                if frame.had_crc {
                    self.peers[address as usize].smack_enabled = true;
                }
                match frame.command {
                    Command::Data => {
                        events.push(EngineEvent::Frame {
                            address,
                            port,
                            payload: frame.payload,
                        });
                    }
                    Command::Poll => {
                        events.push(EngineEvent::Poll {
                            address: frame.address,
                        });
                    }
                    _ => {
                        log::debug!("ignoring non-DATA/POLL command {:?}", frame.command);
                    }
                }
            }
            Err(KissError::CrcError) => self.stats.crc_errors += 1,
            Err(KissError::ChecksumError) => self.stats.xor_errors += 1,
            Err(_) => {
                self.stats.decode_errors += 1;
                events.push(EngineEvent::DecodeError);
            }
        }
    }

    /// True if `address` is addressed to us and we are in passive mode -
    /// i.e. an inbound POLL event should trigger a queue drain.
    pub fn should_drain_on_poll(&self, polled_address: u8) -> bool {
        self.config.polling_mode == PollingMode::Passive && polled_address == self.config.own_address
    }

    /// Drain every port queue for `address`, returning ready-to-send wire
    /// frames in FIFO order. Used both for the passive auto-drain-on-POLL
    /// path and for the manual `poll()` flush-all API.
    ///
    /// If the caller's transport write fails partway through, pass the
    /// untransmitted tail to [`KissEngine::requeue`] to restore FIFO order.
    pub fn drain_queues_for(&mut self, address: u8) -> Vec<(u8, QueueEntry)> {
        let peer = &mut self.peers[address as usize];
        let mut out = Vec::new();
        for port in 0..16u8 {
            if let Some(queue) = peer.queues[port as usize].as_mut() {
                for entry in queue.drain() {
                    out.push((port, entry));
                }
            }
        }
        out
    }

    /// Re-queue an undelivered tail at the head of its port's queue,
    /// preserving order, after an aborted drain.
    pub fn requeue(&mut self, address: u8, port: u8, entries: Vec<QueueEntry>) {
        if entries.is_empty() {
            return;
        }
        let capacity = self.config.max_queue_size;
        let queue = self.peers[address as usize].queue_mut(port, capacity);
        queue.requeue_front(entries);
    }

    /// Build the wire frame for a single drained entry, so the caller can
    /// transmit it with the correct per-peer checksum mode.
    pub fn encode_drained_entry(&self, address: u8, port: u8, entry: &QueueEntry) -> Result<Vec<u8>, KissError> {
        self.encode_data_frame(address, port, &entry.payload)
    }

    /// Advance the engine's clock and, in active mode, return any POLL
    /// frames now due for transmission.
    pub fn poll_tick(&mut self, now_tick: u64) -> Vec<Vec<u8>> {
        if self.config.polling_mode != PollingMode::Active {
            return Vec::new();
        }
        let due = match self.next_poll_due {
            None => true,
            Some(t) => now_tick >= t,
        };
        if !due {
            return Vec::new();
        }
        self.next_poll_due = Some(now_tick + self.config.poll_interval_ticks);

        let mut frames = Vec::with_capacity(self.config.poll_addresses.len());
        for &addr in &self.config.poll_addresses.clone() {
            match encode_frame(addr, Command::Poll, &[], ChecksumMode::Plain) {
                Ok(wire) => {
                    self.stats.tx_frames += 1;
                    frames.push(wire);
                }
                Err(e) => log::warn!("failed to encode poll frame for address {addr}: {e:?}"),
            }
        }
        frames
    }

    /// Encode a POLL frame addressed to `address`. Used by tests to simulate
    /// an inbound poll from a bus master without a real transport.
    pub fn encode_poll(address: u8) -> Result<Vec<u8>, KissError> {
        encode_frame(address, Command::Poll, &[], ChecksumMode::Plain)
    }

    /// Encode a host-to-TNC configuration command (TX_DELAY, PERSISTENCE,
    /// SLOT_TIME, TX_TAIL, FULL_DUPLEX, SET_HARDWARE, RETURN) for immediate
    /// transmission. These never carry SMACK/XOR regardless of peer state -
    /// only DATA is ever checksummed - and they always go out now rather
    /// than through a peer's port queue: they configure the locally attached
    /// TNC, they are not a payload addressed to a bus peer.
    ///
    /// `Command::Data` and `Command::Poll` are rejected with
    /// `KissError::InvalidCommand`: DATA must go through `send()` so it gets
    /// the peer's current SMACK/XOR mode and passive-mode queueing, and POLL
    /// is only ever emitted by the active poller or `encode_poll`.
    pub fn send_command(
        &mut self,
        port_or_address: u8,
        command: Command,
        payload: &[u8],
    ) -> Result<Vec<u8>, KissError> {
        if matches!(command, Command::Data | Command::Poll) {
            return Err(KissError::InvalidCommand);
        }
        let wire = encode_frame(port_or_address, command, payload, ChecksumMode::Plain)?;
        self.stats.tx_frames += 1;
        Ok(wire)
    }

    pub fn is_smack_enabled(&self, address: u8) -> bool {
        self.peers[address as usize].smack_enabled
    }

    pub fn own_address(&self) -> u8 {
        self.config.own_address
    }

    /// Drop every buffered passive-mode payload across every peer and port,
    /// returning the number of entries discarded. Used by `close()` to
    /// account for queued work abandoned on shutdown.
    pub fn discard_all_queues(&mut self) -> usize {
        let mut discarded = 0;
        for peer in &mut self.peers {
            for slot in &mut peer.queues {
                if let Some(queue) = slot.as_mut() {
                    discarded += queue.drain().len();
                }
            }
        }
        discarded
    }
}

/// Validate a `SessionConfig`-shaped set of inputs before constructing an
/// engine.
pub fn validate_config(
    poll_interval_ticks: u64,
    max_queue_size: usize,
    own_address: u8,
) -> Result<(), KissError> {
    if poll_interval_ticks == 0 || max_queue_size == 0 || own_address > 0x0F {
        return Err(KissError::InvalidAddress);
    }
    let _ = address::pack(own_address, 0)?;
    let _ = crc::xor_checksum(&[]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(mode: PollingMode) -> KissEngine {
        KissEngine::new(EngineConfig {
            polling_mode: mode,
            own_address: 7,
            ..Default::default()
        })
    }

    #[test]
    fn off_mode_send_transmits_immediately() {
        let mut e = engine(PollingMode::Off);
        let (outcome, overflow) = e.send(0, 3, b"hi", 0).unwrap();
        assert!(overflow.is_none());
        match outcome {
            SendOutcome::Transmit(wire) => {
                assert_eq!(wire[0], 0xC0);
                assert_eq!(*wire.last().unwrap(), 0xC0);
            }
            SendOutcome::Queued => panic!("expected immediate transmit in off mode"),
        }
        assert_eq!(e.stats().tx_frames, 1);
    }

    #[test]
    fn passive_mode_send_queues_until_polled() {
        let mut e = engine(PollingMode::Passive);
        for payload in [&b"one"[..], &b"two"[..], &b"three"[..]] {
            let (outcome, overflow) = e.send(7, 0, payload, 0).unwrap();
            assert_eq!(outcome, SendOutcome::Queued);
            assert!(overflow.is_none());
        }

        let events = e.handle_rx_bytes(&encode_poll_wire(7));
        assert_eq!(events, vec![EngineEvent::Poll { address: 7 }]);
        assert!(e.should_drain_on_poll(7));

        let drained = e.drain_queues_for(7);
        assert_eq!(drained.len(), 3);
        let payloads: Vec<Vec<u8>> = drained.iter().map(|(_, entry)| entry.payload.clone()).collect();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    }

    #[test]
    fn aborted_drain_requeues_tail_preserving_order() {
        let mut e = engine(PollingMode::Passive);
        for payload in [&b"a"[..], &b"b"[..], &b"c"[..]] {
            e.send(7, 1, payload, 0).unwrap();
        }
        let mut drained = e.drain_queues_for(7);
        // pretend we transmitted only the first entry before a transport failure
        let (port, _first) = drained.remove(0);
        let tail: Vec<QueueEntry> = drained.into_iter().map(|(_, entry)| entry).collect();
        e.requeue(7, port, tail);

        let redo = e.drain_queues_for(7);
        let payloads: Vec<Vec<u8>> = redo.iter().map(|(_, entry)| entry.payload.clone()).collect();
        assert_eq!(payloads, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn smack_stickiness_switches_subsequent_transmissions() {
        // `engine()` leaves `multi_drop: false`, so the only addressable peer
        // is `own_address` (7); the wire type byte's high nibble (2, below)
        // is a port in this mode, not a second peer.
        let mut e = engine(PollingMode::Off);
        assert!(!e.is_smack_enabled(7));

        let wire = encode_frame(2, Command::Data, b"hi", ChecksumMode::Smack).unwrap();
        let raw = &wire[1..wire.len() - 1];
        let events = e.handle_rx_bytes(&[&[0xC0][..], raw, &[0xC0][..]].concat());
        assert!(matches!(
            events[0],
            EngineEvent::Frame { address: 7, port: 2, .. }
        ));
        assert!(e.is_smack_enabled(7));

        let (outcome, _) = e.send(7, 0, b"reply", 0).unwrap();
        match outcome {
            SendOutcome::Transmit(wire) => {
                assert_eq!(wire[1] & 0x80, 0x80, "bit 7 must be set once SMACK is enabled");
            }
            SendOutcome::Queued => panic!(),
        }

        // never reverts even if a later frame lacks CRC
        let plain = encode_frame(3, Command::Data, b"plain", ChecksumMode::Plain).unwrap();
        e.handle_rx_bytes(&plain);
        assert!(e.is_smack_enabled(7));
    }

    #[test]
    fn smack_stickiness_keys_on_wire_address_in_multi_drop_mode() {
        let mut e = KissEngine::new(EngineConfig {
            polling_mode: PollingMode::Off,
            multi_drop: true,
            own_address: 0,
            ..Default::default()
        });
        assert!(!e.is_smack_enabled(5));

        let wire = encode_frame(5, Command::Data, b"hi", ChecksumMode::Smack).unwrap();
        let raw = &wire[1..wire.len() - 1];
        let events = e.handle_rx_bytes(&[&[0xC0][..], raw, &[0xC0][..]].concat());
        assert!(matches!(
            events[0],
            EngineEvent::Frame { address: 5, port: 0, .. }
        ));
        assert!(e.is_smack_enabled(5));

        let (outcome, _) = e.send(5, 0, b"reply", 0).unwrap();
        match outcome {
            SendOutcome::Transmit(wire) => {
                assert_eq!(wire[1] & 0x80, 0x80, "bit 7 must be set once SMACK is enabled");
            }
            SendOutcome::Queued => panic!(),
        }
    }

    #[test]
    fn active_mode_polls_each_configured_address_once_per_interval() {
        let mut e = KissEngine::new(EngineConfig {
            polling_mode: PollingMode::Active,
            poll_interval_ticks: 100,
            poll_addresses: vec![1, 2, 3],
            ..Default::default()
        });
        let frames = e.poll_tick(0);
        assert_eq!(frames.len(), 3);
        assert!(e.poll_tick(50).is_empty());
        assert_eq!(e.poll_tick(100).len(), 3);
    }

    #[test]
    fn invalid_address_is_rejected_before_any_encoding() {
        let mut e = engine(PollingMode::Off);
        assert_eq!(e.send(16, 0, b"x", 0), Err(KissError::InvalidAddress));
    }

    #[test]
    fn overflow_reports_dropped_entry() {
        let mut e = KissEngine::new(EngineConfig {
            polling_mode: PollingMode::Passive,
            max_queue_size: 2,
            own_address: 7,
            ..Default::default()
        });
        e.send(7, 0, b"1", 0).unwrap();
        e.send(7, 0, b"2", 0).unwrap();
        let (_, overflow) = e.send(7, 0, b"3", 0).unwrap();
        let overflow = overflow.unwrap();
        assert_eq!(overflow.dropped_payload, b"1");
        assert_eq!(e.stats().overflows, 1);
    }

    fn encode_poll_wire(address: u8) -> Vec<u8> {
        KissEngine::encode_poll(address).unwrap()
    }

    #[test]
    fn send_command_is_plain_and_counted() {
        let mut e = engine(PollingMode::Off);
        let wire = e.send_command(3, Command::TxDelay, &[50]).unwrap();
        assert_eq!(wire, vec![0xC0, 0x31, 50, 0xC0]);
        assert_eq!(e.stats().tx_frames, 1);

        // RETURN carries no payload at all.
        let wire = e.send_command(0, Command::Return, &[]).unwrap();
        assert_eq!(wire, vec![0xC0, 0x0F, 0xC0]);
    }

    #[test]
    fn send_command_rejects_data_and_poll() {
        let mut e = engine(PollingMode::Off);
        assert_eq!(
            e.send_command(7, Command::Data, b"x"),
            Err(KissError::InvalidCommand)
        );
        assert_eq!(
            e.send_command(7, Command::Poll, &[]),
            Err(KissError::InvalidCommand)
        );
        assert_eq!(e.stats().tx_frames, 0);
    }

    #[test]
    fn discard_all_queues_clears_every_peer_and_port() {
        let mut e = engine(PollingMode::Passive);
        e.send(7, 0, b"a", 0).unwrap();
        e.send(7, 1, b"b", 0).unwrap();
        e.send(3, 0, b"c", 0).unwrap();
        assert_eq!(e.discard_all_queues(), 3);
        assert!(e.drain_queues_for(7).is_empty());
        assert!(e.drain_queues_for(3).is_empty());
        assert_eq!(e.discard_all_queues(), 0);
    }
}
