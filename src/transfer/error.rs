use thiserror::Error;

/// Typed transfer errors enabling retry classification.
///
/// `is_transient()` separates failures worth retrying (timeouts, connection
/// errors, rate limits, server errors) from permanent ones (rejected
/// requests, missing assets, malformed responses, local disk failures).
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP {status} during {operation}: {body}")]
    HttpStatus {
        status: u16,
        operation: String,
        body: String,
    },

    #[error("Network error during {operation}: {source}")]
    Network {
        operation: String,
        source: reqwest::Error,
    },

    #[error("Server unavailable during {operation}: {message}")]
    Unavailable { operation: String, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unexpected response during {operation}: {message}")]
    Protocol { operation: String, message: String },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::HttpStatus { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            TransferError::Network { .. } => true,
            TransferError::Unavailable { .. } => true,
            TransferError::NotFound(_) => false,
            TransferError::Protocol { .. } => false,
            TransferError::Disk(_) => false,
        }
    }

    /// Local I/O failure rather than something the remote side did.
    pub fn is_local(&self) -> bool {
        matches!(self, TransferError::Disk(_))
    }
}
