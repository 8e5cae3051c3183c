//! Error taxonomy shared by every layer of the transport stack.
//!
//! Each background worker that hits a fatal condition stores one of
//! these in the channel's error slot; callers see it on their next
//! `Read`. `Write` only ever surfaces immediate local or lower-layer I/O
//! failures.

use std::io;

/// Errors raised while framing, checksumming, multiplexing or sequencing
/// bytes on the wire.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Fewer bytes arrived than the header or trailer required.
    #[error("short read: expected at least {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },

    /// The trailing CRC-32 did not match the payload.
    #[error("checksum mismatch: calculated {calculated:#010x}, on-wire {on_wire:#010x}")]
    ChecksumMismatch { calculated: u32, on_wire: u32 },

    /// A length field disagreed with what was actually on the wire (Mux
    /// `pktlen`, Sequencer `msglen`, or a reserved field holding a
    /// non-zero value).
    #[error("framing violation: {0}")]
    FramingViolation(String),

    /// A Sequencer invariant was contradicted by the peer (an `ack` ahead
    /// of `seqXmt`, or one that prunes past the retransmit buffer).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The channel this layer wraps returned an I/O error.
    #[error("lower-layer I/O error: {0}")]
    LowerIo(#[from] io::Error),

    /// The channel has been closed; no further I/O is possible.
    #[error("channel closed")]
    Closed,
}

impl From<TransportError> for io::Error {
    fn from(err: TransportError) -> io::Error {
        match err {
            TransportError::LowerIo(e) => e,
            TransportError::Closed => io::Error::new(io::ErrorKind::NotConnected, err.to_string()),
            TransportError::ShortRead { .. } => {
                io::Error::new(io::ErrorKind::UnexpectedEof, err.to_string())
            }
            TransportError::ChecksumMismatch { .. }
            | TransportError::FramingViolation(_)
            | TransportError::ProtocolViolation(_) => {
                io::Error::new(io::ErrorKind::InvalidData, err.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
