//! Abstract byte-stream endpoint a [`crate::session::Session`] drives the
//! wire protocol over, plus a concrete serial-port implementation.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::SerialPort;

/// A serial-style byte transport: open, read, write, close, reconnect.
///
/// Implementations must support cloning into two cooperating handles: one
/// for the session's reader thread, one for the writer side shared between
/// `send()`, the active-mode poller, and passive-mode auto-drain. This
/// mirrors how a TNC handle is split in two for concurrent reading and
/// writing.
///
/// `read` should not block indefinitely - a bounded timeout lets the reader
/// thread notice a shutdown request without waiting for inbound bytes that
/// may never arrive.
pub trait Transport: Read + Write + Send + 'static {
    /// Produce a second handle to the same endpoint, for the writer side.
    fn try_clone(&mut self) -> io::Result<Self>
    where
        Self: Sized;

    /// Attempt to reopen the endpoint after a read or write failure. Exactly
    /// one reconnect attempt is made per failure; a deeper retry loop is a
    /// concern for a supervisor above this crate.
    fn reconnect(&mut self) -> io::Result<()>;

    /// Release any underlying resources. Best-effort: dropping the handle is
    /// sufficient on platforms where that alone releases the device.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn io_err(e: serialport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

/// A KISS TNC reachable over a local serial port, via the `serialport` crate.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
    path: String,
    baud: u32,
}

impl SerialTransport {
    /// List locally visible serial device names, for CLI device discovery.
    pub fn available_ports() -> impl Iterator<Item = String> {
        serialport::available_ports()
            .unwrap_or_default()
            .into_iter()
            .map(|i| i.port_name)
    }

    /// Open `path` at `baud`. A short read timeout keeps the reader thread
    /// responsive to shutdown requests even when the TNC is silent.
    pub fn open(path: &str, baud: u32) -> io::Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(200))
            .open()
            .map_err(io_err)?;
        Ok(Self {
            port,
            path: path.to_string(),
            baud,
        })
    }
}

impl Read for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            // A timeout with no bytes ready is not an error from the
            // reader thread's point of view - it's a chance to check the
            // stop flag and loop again.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl Write for SerialTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Transport for SerialTransport {
    fn try_clone(&mut self) -> io::Result<Self> {
        let cloned = self.port.try_clone().map_err(io_err)?;
        Ok(Self {
            port: cloned,
            path: self.path.clone(),
            baud: self.baud,
        })
    }

    fn reconnect(&mut self) -> io::Result<()> {
        self.port = serialport::new(&self.path, self.baud)
            .timeout(Duration::from_millis(200))
            .open()
            .map_err(io_err)?;
        Ok(())
    }
}
