//! Error types for the demultiplexer.

use thiserror::Error;

/// Errors raised while decoding transport-level structures.
///
/// None of these are fatal to a session: the packet loop counts them and
/// moves on to the next packet.
#[derive(Error, Debug)]
pub enum DemuxError {
    /// Fewer bytes than one transport packet.
    #[error("short packet: {0} bytes (need {1})")]
    ShortPacket(usize, usize),

    /// First byte is not the 0x47 sync byte.
    #[error("lost sync: expected 0x47, got 0x{0:02X}")]
    LostSync(u8),

    /// adaptation_field_length points past the end of the packet.
    #[error("adaptation field of {length} bytes overflows packet")]
    AdaptationOverflow { length: usize },

    /// Section too short for the header its syntax indicator announces.
    #[error("section on PID 0x{pid:04X} too short: {length} bytes")]
    SectionTooShort { pid: u16, length: usize },

    /// CRC-32 of a long-form section does not match.
    #[error("CRC-32 mismatch in table 0x{table_id:02X} on PID 0x{pid:04X}")]
    SectionCrc { pid: u16, table_id: u8 },

    /// A bit-field read ran past the end of its buffer.
    #[error("truncated {what}")]
    Truncated {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Configuration that cannot describe a transport stream.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, DemuxError>;

/// Maps bitstream-io EOF errors onto [`DemuxError::Truncated`].
pub(crate) fn truncated(what: &'static str) -> impl FnOnce(std::io::Error) -> DemuxError {
    move |source| DemuxError::Truncated { what, source }
}
