//! Threaded host integration for [`kisscore`]: a `Transport` trait around an
//! abstract serial endpoint, a concrete `serialport`-backed implementation,
//! and a `Session` that owns the reader/poller threads driving a
//! [`kisscore::KissEngine`] and dispatching decoded frames to user callbacks.

pub mod error;
pub mod session;
pub mod transport;

#[cfg(test)]
mod test_util;

pub use error::SessionError;
pub use session::{ErrorKind, Session, SessionConfig, SessionStats};
pub use transport::{SerialTransport, Transport};
