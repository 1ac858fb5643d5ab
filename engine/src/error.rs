//! Error types carried through the engine.

use std::io;

/// Terminal error recorded against a single connection.
///
/// Protocol violations are distinguished from transport errors so the summary
/// counters can report them separately. Transport errors keep only the
/// `io::ErrorKind` - the raw OS code is logged at the point of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    /// Fewer bytes arrived than the protocol required.
    TooFewBytes,
    /// More bytes arrived than the protocol allows.
    TooManyBytes,
    /// A frame failed validation (bad tag, short header).
    CorruptFrame,
    /// A socket-level failure.
    Io(io::ErrorKind),
}

impl TransferError {
    pub fn from_io(error: &io::Error) -> Self {
        TransferError::Io(error.kind())
    }

    /// Protocol violations count against `protocol_errors`; everything else
    /// counts against `connection_errors`.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            TransferError::TooFewBytes | TransferError::TooManyBytes | TransferError::CorruptFrame
        )
    }

    /// Reset-class codes a server in the FIN-wait exchange treats as a benign
    /// alternative teardown: the client may RST after receiving the
    /// completion marker rather than closing gracefully.
    pub fn is_benign_reset(&self) -> bool {
        matches!(
            self,
            TransferError::Io(io::ErrorKind::ConnectionReset)
                | TransferError::Io(io::ErrorKind::ConnectionAborted)
                | TransferError::Io(io::ErrorKind::TimedOut)
        )
    }
}

impl std::fmt::Display for TransferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferError::TooFewBytes => write!(f, "too few bytes"),
            TransferError::TooManyBytes => write!(f, "too many bytes"),
            TransferError::CorruptFrame => write!(f, "corrupt frame"),
            TransferError::Io(kind) => write!(f, "io error: {kind}"),
        }
    }
}

/// Failures admitting or servicing a connection.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("connection-id slots exhausted")]
    IdSlotsExhausted,
    #[error("connection already closed")]
    ConnectionClosed,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
