use std::io;

use thiserror::Error;

pub type TransferResult<T> = std::result::Result<T, TransmissionError>;

/// Errors surfaced by the protocol engines and the session facade.
///
/// `FileSkipped` is not fatal for a batch; `Crc` and singleton timeouts are
/// normally recovered inside the engines and only escape once the retry
/// budget is spent.
#[derive(Debug, Error)]
pub enum TransmissionError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("crc mismatch: {0}")]
    Crc(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("file skipped by peer")]
    FileSkipped,

    #[error("remote command refused: {0:?}")]
    CommandDenied(String),
}

impl TransmissionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransmissionError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransmissionError::Timeout(_))
    }
}
