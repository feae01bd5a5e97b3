/// Protocol-level error taxonomy.
///
/// These never carry an I/O cause - that lives one layer up, in the transport
/// integration - so the core can stay usable without `std`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KissError {
    /// Address or port nibble outside 0..=15.
    InvalidAddress,
    /// Malformed escape sequence or a frame too short to contain a header byte.
    FrameDecodeError,
    /// XOR checksum did not match the frame contents.
    ChecksumError,
    /// SMACK CRC-16 did not match the frame contents.
    CrcError,
    /// A command frame buffer was too small to hold the requested payload.
    PayloadTooBig,
    /// `KissEngine::send_command` was asked to send `Command::Data` or
    /// `Command::Poll`, which have their own dedicated paths (`send()`,
    /// the active poller, and the passive auto-drain) and must not be
    /// issued as a plain configuration command.
    InvalidCommand,
}
