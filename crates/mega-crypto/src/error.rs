//! Error taxonomy for the crypto core

use std::io;

use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Computed MetaMac differs from the one stored in the node key
    #[error("download corrupted: expected MAC {expected}, computed {computed}")]
    DownloadCorrupted { expected: String, computed: String },

    #[error(
        "invalid read size: {requested} bytes at position {position} of {length}; \
         reads before the end of the stream must be at least 16 bytes"
    )]
    InvalidReadSize {
        requested: usize,
        position: u64,
        length: u64,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("invalid {what} length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("data length {0} is not a multiple of the 16-byte AES block")]
    InvalidBlockLength(usize),

    #[error("source stream ended after {actual} of {expected} bytes")]
    TruncatedSource { expected: u64, actual: u64 },

    /// A previous read failed part-way; the stream state is unusable
    #[error("crypto stream failed at byte {position}; restart the transfer from byte 0")]
    StreamFailed { position: u64 },

    #[error("node {handle} must support key access ({capability})")]
    KeyAccess {
        handle: String,
        capability: &'static str,
    },

    #[error("node {handle} references unknown share {share}")]
    UnresolvedShareKey { handle: String, share: String },

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("invalid public link: {0}")]
    InvalidLink(String),

    #[error("stream not finished: {position} of {length} bytes consumed")]
    StreamNotFinished { position: u64, length: u64 },

    #[error("upload plan covers {planned} bytes but the stream has {length}")]
    PlanMismatch { planned: u64, length: u64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(anyhow::Error),
}

impl CryptoError {
    /// Whether restarting the whole transfer from byte 0 may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CryptoError::DownloadCorrupted { .. }
                | CryptoError::TruncatedSource { .. }
                | CryptoError::StreamFailed { .. }
                | CryptoError::Transport(_)
        )
    }

    /// Recover a typed error carried inside an `io::Error` from a stream read.
    pub fn from_io(err: &io::Error) -> Option<&CryptoError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<CryptoError>())
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            CryptoError::InvalidReadSize { .. } => io::ErrorKind::InvalidInput,
            CryptoError::Unsupported(_) => io::ErrorKind::Unsupported,
            CryptoError::TruncatedSource { .. } => io::ErrorKind::UnexpectedEof,
            CryptoError::Cancelled => io::ErrorKind::Interrupted,
            _ => io::ErrorKind::InvalidData,
        }
    }
}

impl From<CryptoError> for io::Error {
    fn from(err: CryptoError) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}

/// Unwraps a `CryptoError` raised inside a stream read; anything else is a
/// transport failure of the underlying source or sink.
impl From<io::Error> for CryptoError {
    fn from(err: io::Error) -> Self {
        if CryptoError::from_io(&err).is_none() {
            return CryptoError::Transport(err.into());
        }
        match err.into_inner().map(|inner| inner.downcast::<CryptoError>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(other)) => CryptoError::Transport(anyhow::anyhow!(other)),
            None => CryptoError::Transport(anyhow::anyhow!("I/O error without payload")),
        }
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(err: base64::DecodeError) -> Self {
        CryptoError::Encoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_roundtrip_keeps_variant() {
        let err: io::Error = CryptoError::InvalidReadSize {
            requested: 15,
            position: 0,
            length: 32,
        }
        .into();

        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(matches!(
            CryptoError::from_io(&err),
            Some(CryptoError::InvalidReadSize { requested: 15, .. })
        ));
    }

    #[test]
    fn test_io_error_converts_back() {
        let err: io::Error = CryptoError::Unsupported("seek").into();
        assert!(matches!(
            CryptoError::from(err),
            CryptoError::Unsupported("seek")
        ));

        let plain = io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        assert!(matches!(CryptoError::from(plain), CryptoError::Transport(_)));
    }

    #[test]
    fn test_plain_io_error_has_no_crypto_error() {
        let err = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(CryptoError::from_io(&err).is_none());
    }

    #[test]
    fn test_retryable_classification() {
        let corrupted = CryptoError::DownloadCorrupted {
            expected: "00".into(),
            computed: "01".into(),
        };
        assert!(corrupted.is_retryable());
        assert!(!CryptoError::Unsupported("seek").is_retryable());
        assert!(!CryptoError::InvalidBlockLength(3).is_retryable());
        assert!(CryptoError::StreamFailed { position: 32 }.is_retryable());
    }
}
