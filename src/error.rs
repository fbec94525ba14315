use crate::protocol::Unit;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),

    #[error("Link corruption: {0}")]
    LinkCorruption(String),

    #[error("Link timeout: {0}")]
    LinkTimeout(String),

    #[error("Retry exhausted: {unit} not acknowledged after {attempts} attempts")]
    RetryExhausted { unit: Unit, attempts: u32 },

    #[error("Oversized payload: block {block} declares {len} bytes, max {max}")]
    OversizedPayload { block: u16, len: usize, max: usize },

    #[error("Storage read failure at {address:#x}: {source}")]
    StorageRead {
        address: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

impl Error {
    /// Corruption and timeouts are recovered by NACK and resend; everything
    /// else aborts the transfer.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::LinkCorruption(_) | Error::LinkTimeout(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
