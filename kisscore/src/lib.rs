#![allow(clippy::needless_range_loop)]

//! Protocol core for KISS, XKISS/BPQ multi-drop, and SMACK CRC-16 framing.
//!
//! Nothing here touches a byte stream, a thread, or a clock beyond the tick
//! values callers pass in. [`engine::KissEngine`] is the sans-I/O state
//! machine that ties the codec, command table, address codec, and per-port
//! queues together; a host integration feeds it bytes and drains frames.

pub mod address;
pub mod command;
pub mod crc;
pub mod engine;
pub mod error;
pub mod frame;
pub mod kiss;
pub mod queue;

pub use command::Command;
pub use engine::{
    EngineConfig, EngineEvent, EngineStats, KissEngine, Overflow, PollingMode, SendOutcome,
};
pub use error::KissError;
pub use frame::{ChecksumMode, Frame};
