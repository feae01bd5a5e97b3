//! In-memory loopback transport for session-level tests, generalizing the
//! teacher's `NullTnc` (which only ever returned `Ok(0)`/swallowed writes)
//! into a two-ended pipe: tests push bytes in to simulate an inbound TNC
//! stream, and can inspect everything the session wrote out.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::transport::Transport;

#[derive(Default)]
struct Shared {
    inbound: Mutex<VecDeque<u8>>,
    inbound_ready: Condvar,
    outbound: Mutex<Vec<u8>>,
    closed: Mutex<bool>,
}

/// A shared in-memory byte pipe standing in for a serial TNC in tests.
#[derive(Clone)]
pub(crate) struct LoopbackTransport {
    shared: Arc<Shared>,
}

impl LoopbackTransport {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
        }
    }

    /// Simulate bytes arriving from the far end of the bus.
    pub(crate) fn push_inbound(&self, bytes: &[u8]) {
        let mut q = self.shared.inbound.lock().unwrap();
        q.extend(bytes);
        self.shared.inbound_ready.notify_all();
    }

    /// Snapshot of everything written to this transport so far.
    pub(crate) fn written(&self) -> Vec<u8> {
        self.shared.outbound.lock().unwrap().clone()
    }
}

impl Read for LoopbackTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut q = self.shared.inbound.lock().unwrap();
        while q.is_empty() {
            if *self.shared.closed.lock().unwrap() {
                return Ok(0);
            }
            let (guard, _) = self
                .shared
                .inbound_ready
                .wait_timeout(q, Duration::from_millis(20))
                .unwrap();
            q = guard;
        }
        let n = q.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(q.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

impl Write for LoopbackTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared.outbound.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for LoopbackTransport {
    fn try_clone(&mut self) -> io::Result<Self> {
        Ok(self.clone())
    }

    fn reconnect(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        *self.shared.closed.lock().unwrap() = true;
        self.shared.inbound_ready.notify_all();
        Ok(())
    }
}
