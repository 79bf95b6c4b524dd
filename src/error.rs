//! Crate-wide error taxonomy.
//!
//! Only [`Error::Timeout`], [`Error::UnknownConnection`] and
//! [`Error::Cancelled`] are meant to reach a caller of the [`ControlPanel`]
//! façade (`crate::ControlPanel`) API; the rest are recovered internally by
//! the `Bus` and only ever observed through `ConnectionStatusChanged` events
//! or log output. They stay public (and `Debug`/`Display`-able) so tests can
//! match on them precisely.

use std::fmt;

use crate::connection::ConnectionId;
use crate::device::Address;

/// Why a decoded-or-attempted frame was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameInvalidReason {
    TooShort { have: usize, need: usize },
    LengthMismatch { declared: usize, actual: usize },
    ChecksumMismatch,
    CrcMismatch,
    MacMismatch,
    BadStartOfMessage,
    AddressMismatch { expected: Address, actual: Address },
    SequenceMismatch { expected: u8, actual: u8 },
}

impl fmt::Display for FrameInvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameInvalidReason::TooShort { have, need } => {
                write!(f, "frame too short: have {have}, need at least {need}")
            }
            FrameInvalidReason::LengthMismatch { declared, actual } => {
                write!(f, "declared length {declared} does not match {actual} bytes received")
            }
            FrameInvalidReason::ChecksumMismatch => write!(f, "8-bit checksum mismatch"),
            FrameInvalidReason::CrcMismatch => write!(f, "16-bit CRC mismatch"),
            FrameInvalidReason::MacMismatch => write!(f, "secure channel MAC mismatch"),
            FrameInvalidReason::BadStartOfMessage => write!(f, "did not resynchronise on SOM"),
            FrameInvalidReason::AddressMismatch { expected, actual } => {
                write!(f, "reply from address {actual} does not match outbound address {expected}")
            }
            FrameInvalidReason::SequenceMismatch { expected, actual } => {
                write!(f, "reply sequence {actual} does not match outbound sequence {expected}")
            }
        }
    }
}

/// Phase of secure-channel establishment that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureChannelPhase {
    ChallengeSend,
    CryptogramVerify,
    ServerCryptogramAck,
    Mac,
}

impl fmt::Display for SecureChannelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecureChannelPhase::ChallengeSend => "challenge-send",
            SecureChannelPhase::CryptogramVerify => "cryptogram-verify",
            SecureChannelPhase::ServerCryptogramAck => "server-cryptogram-ack",
            SecureChannelPhase::Mac => "mac",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid frame: {0}")]
    FrameInvalid(FrameInvalidReason),

    #[error("secure channel failed during {phase}")]
    SecureChannelFailed { phase: SecureChannelPhase },

    #[error("no matching reply within the deadline")]
    Timeout,

    #[error("PIV fragment out of range (offset {offset} + len {len} > whole {whole})")]
    FragmentOutOfRange { offset: usize, len: usize, whole: usize },

    #[error("connection {0:?} is not registered")]
    UnknownConnection(ConnectionId),

    #[error("address {0} has no registered device on this connection")]
    UnknownDevice(Address),

    #[error("request cancelled by caller")]
    Cancelled,

    #[error("bus is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, Error>;
