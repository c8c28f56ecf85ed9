use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Sequence out of order: range {start}-{end} does not extend last sequence {last}")]
    OutOfOrder { start: u64, end: u64, last: u64 },

    #[error("Invalid sequence range: {start}-{end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("Corrupt block: {0}")]
    CorruptBlock(String),

    #[error("Truncated input: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Shutting down")]
    ShuttingDown,
}

impl Error {
    /// Errors that indicate local storage can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::OutOfOrder { .. } | Error::CorruptBlock(_) | Error::IoError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
