//! Error types for h264mp4

use thiserror::Error;

/// Result type alias for h264mp4 operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for h264mp4 operations
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown or already finalized handle
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Width/height not positive and even
    #[error("Invalid dimensions {width}x{height}: width and height must be positive and even")]
    InvalidDimensions { width: u32, height: u32 },

    /// Compressor workspace sizing violated its constraints
    #[error("Invalid workspace size: {0}")]
    InvalidSize(String),

    /// Aligned workspace allocation failed
    #[error("Failed to allocate {size} bytes")]
    AllocationFailure { size: usize },

    /// Coded unit missing its start code or too short
    #[error("Malformed unit: {0}")]
    MalformedUnit(String),

    /// The sink reported a short or failed write
    #[error("Sink write of {len} bytes at offset {offset} failed: {source}")]
    SinkWriteFailure {
        offset: u64,
        len: usize,
        #[source]
        source: std::io::Error,
    },

    /// Invalid input parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Compressor error
    #[error("Encoding error: {0}")]
    Encode(String),

    /// Container writer error
    #[error("Muxing error: {0}")]
    Mux(String),

    /// Options could not be parsed
    #[error("Options error: {0}")]
    Options(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error leaves a muxer unusable
    pub fn is_sink_failure(&self) -> bool {
        matches!(self, Error::SinkWriteFailure { .. })
    }
}

/// Error code for FFI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub enum ErrorCode {
    /// Success
    Ok = 0,
    /// Invalid input parameter
    InvalidInput = 1,
    /// Unknown or finalized handle
    InvalidHandle = 2,
    /// Width/height not positive and even
    InvalidDimensions = 3,
    /// Workspace sizing error
    InvalidSize = 4,
    /// Allocation failure
    AllocationFailure = 5,
    /// Malformed coded unit
    MalformedUnit = 6,
    /// Sink write failed
    SinkWriteFailure = 7,
    /// Encoding error
    EncodeError = 8,
    /// Muxing error
    MuxError = 9,
}

impl From<&Error> for ErrorCode {
    fn from(err: &Error) -> Self {
        match err {
            Error::InvalidHandle(_) => ErrorCode::InvalidHandle,
            Error::InvalidDimensions { .. } => ErrorCode::InvalidDimensions,
            Error::InvalidSize(_) => ErrorCode::InvalidSize,
            Error::AllocationFailure { .. } => ErrorCode::AllocationFailure,
            Error::MalformedUnit(_) => ErrorCode::MalformedUnit,
            Error::SinkWriteFailure { .. } => ErrorCode::SinkWriteFailure,
            Error::InvalidInput(_) => ErrorCode::InvalidInput,
            Error::Options(_) => ErrorCode::InvalidInput,
            Error::Encode(_) => ErrorCode::EncodeError,
            Error::Mux(_) => ErrorCode::MuxError,
        }
    }
}
