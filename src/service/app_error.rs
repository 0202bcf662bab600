pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    DetailedIoError(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// producer state errors
    #[error("invalid producer epoch: {0}")]
    InvalidProducerEpoch(String),

    #[error("out of order sequence: {0}")]
    OutOfOrderSequence(String),

    #[error("invalid transaction state: {0}")]
    InvalidTxnState(String),

    #[error("snapshot corrupt: {0}")]
    SnapshotCorrupt(String),

    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    /// cursor sentinel, raised by the log store when the tail is reached
    #[error("no more entries to read")]
    NoMoreEntriesToRead,

    /// record format errors
    #[error("corrupt message: {0}")]
    CorruptMessage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl AppError {
    /// Whether the error should fence the producer rather than fail the broker.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AppError::InvalidProducerEpoch(_)
                | AppError::OutOfOrderSequence(_)
                | AppError::InvalidTxnState(_)
        )
    }
}
