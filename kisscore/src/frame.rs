//! Frame encode/decode: composing a type byte, payload, and optional
//! checksum/CRC, then handing the result to [`crate::kiss`] for escaping.

use crate::address;
use crate::command::Command;
use crate::crc::{smack_crc, xor_checksum};
use crate::error::KissError;
use crate::kiss::{self, FEND, MAX_PAYLOAD_LEN};

/// Which trailing integrity check, if any, an encoded DATA frame should carry.
///
/// Only `Command::Data` frames are ever checksummed: config commands, POLL,
/// and RETURN are always encoded plain regardless of `mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    Plain,
    Xor,
    Smack,
}

/// A fully decoded KISS/XKISS/SMACK frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    pub command: Command,
    pub payload: Vec<u8>,
    /// True if a valid SMACK CRC-16 was present and stripped.
    pub had_crc: bool,
    /// True if a valid XOR checksum was present and stripped.
    pub had_xor: bool,
}

/// Encode `(address, command, payload)` into a complete wire-form frame,
/// including the leading and trailing FEND.
pub fn encode_frame(
    address: u8,
    command: Command,
    payload: &[u8],
    mode: ChecksumMode,
) -> Result<Vec<u8>, KissError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(KissError::PayloadTooBig);
    }
    let nibble = command.nibble();
    let mut type_byte = address::pack(address, nibble)?;

    let checksummable = command.is_checksummable();
    let use_smack = checksummable && mode == ChecksumMode::Smack;
    let use_xor = checksummable && !use_smack && mode == ChecksumMode::Xor;
    if use_smack {
        type_byte |= 0x80;
    }

    let mut body = Vec::with_capacity(1 + payload.len() + 2);
    body.push(type_byte);
    body.extend_from_slice(payload);

    if use_smack {
        let crc = smack_crc(&body);
        body.extend_from_slice(&crc.to_le_bytes());
    } else if use_xor {
        body.push(xor_checksum(&body));
    }

    let mut escaped = vec![0u8; body.len() * 2];
    let n = kiss::escape(&body, &mut escaped);

    let mut wire = Vec::with_capacity(n + 2);
    wire.push(FEND);
    wire.extend_from_slice(&escaped[..n]);
    wire.push(FEND);
    Ok(wire)
}

/// Decode the still-escaped bytes between a pair of FENDs (as returned by
/// [`crate::kiss::KissBuffer::next_frame`]) into a [`Frame`].
///
/// `xor_enabled` reflects whether the session has XOR checksumming turned on;
/// unlike SMACK, plain KISS has no bit that marks a frame as XOR-checksummed,
/// so the caller's session-wide configuration decides whether the trailing
/// byte is a checksum or payload.
pub fn decode_frame(raw: &[u8], xor_enabled: bool) -> Result<Frame, KissError> {
    let mut body = [0u8; 1 + MAX_PAYLOAD_LEN + 2];
    let len = kiss::unescape(raw, &mut body)?;
    if len < 1 {
        return Err(KissError::FrameDecodeError);
    }
    let body = &body[..len];

    let orig_type_byte = body[0];
    let had_crc = orig_type_byte & 0x80 != 0;
    let (address, nibble) = address::unpack(orig_type_byte & 0x7F);
    let command = Command::from_nibble(nibble)?;

    if had_crc {
        if len < 3 {
            return Err(KissError::FrameDecodeError);
        }
        let payload_end = len - 2;
        let received = u16::from_le_bytes([body[len - 2], body[len - 1]]);
        let computed = smack_crc(&body[..payload_end]);
        if received != computed {
            return Err(KissError::CrcError);
        }
        return Ok(Frame {
            address,
            command,
            payload: body[1..payload_end].to_vec(),
            had_crc: true,
            had_xor: false,
        });
    }

    if xor_enabled && command.is_checksummable() {
        if len < 2 {
            return Err(KissError::FrameDecodeError);
        }
        let payload_end = len - 1;
        let received = body[len - 1];
        let computed = xor_checksum(&body[..payload_end]);
        if received != computed {
            return Err(KissError::ChecksumError);
        }
        return Ok(Frame {
            address,
            command,
            payload: body[1..payload_end].to_vec(),
            had_crc: false,
            had_xor: true,
        });
    }

    Ok(Frame {
        address,
        command,
        payload: body[1..].to_vec(),
        had_crc: false,
        had_xor: false,
    })
}
