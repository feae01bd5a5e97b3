use std::io;
use std::sync::Arc;

use kisscore::KissError;
use thiserror::Error;

/// Errors a [`crate::session::Session`] can raise to its caller.
///
/// Protocol-level problems (`kisscore::KissError`'s frame/CRC/checksum
/// variants) are normally recovered locally and only reach the caller via
/// `on_error`; they appear here too so that synchronous APIs like `send()`
/// and `open()` have something to return for the address/config checks that
/// must fail before any I/O happens.
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    #[error("protocol-level error: {0:?}")]
    Protocol(KissError),

    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),

    #[error("session has moved to a failed state after an unrecoverable transport error")]
    Failed,
}

impl From<KissError> for SessionError {
    fn from(e: KissError) -> Self {
        SessionError::Protocol(e)
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Transport(Arc::new(e))
    }
}
