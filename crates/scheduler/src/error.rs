//! Error types for the fetch scheduler
//!
//! Only submission-time problems are returned as errors. Everything that
//! goes wrong after a request has been accepted is delivered through the
//! request's listener instead.

use tilefetch_raster::{PyramidError, ReadError};

/// Errors returned synchronously by request construction and the scheduler
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Malformed region, size or tile address; no request was created.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The request is not in a state that allows the operation.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// Work did not drain before the wait deadline.
    #[error("timed out waiting for the scheduler to become idle")]
    Timeout,

    /// Opaque failure reported by the tile source.
    #[error(transparent)]
    SourceRead(#[from] ReadError),

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

impl From<PyramidError> for FetchError {
    fn from(error: PyramidError) -> Self {
        FetchError::InvalidArgument(error.to_string())
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pyramid_errors_are_invalid_arguments() {
        let error: FetchError = PyramidError::NegativeCoordinate(-4).into();
        assert!(matches!(error, FetchError::InvalidArgument(_)));
    }

    #[test]
    fn test_source_read_is_transparent() {
        let error: FetchError = ReadError::failed(2, "bad strip").into();
        assert_eq!(error.to_string(), "source read failed (code 2): bad strip");
    }
}
