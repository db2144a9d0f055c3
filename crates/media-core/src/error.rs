use thiserror::Error;

/// Result type for media operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for media operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// No translation path between two formats
    #[error("No translation path from {from} to {to}")]
    NoTranslationPath {
        /// Source format name
        from: String,
        /// Target format name
        to: String,
    },

    /// Translation failed on a frame
    #[error("Translation error: {0}")]
    Translation(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Malformed tone list or digit table
    #[error("Invalid tone specification: {0}")]
    InvalidTone(String),

    /// Jitter buffer write cursor lapped the read cursor
    #[error("Jitter buffer overflow, {discarded} bytes discarded")]
    JitterOverflow {
        /// Unread bytes lost to the resynchronisation
        discarded: usize,
    },

    /// Invalid DTMF digit
    #[error("Invalid DTMF digit: {0:?}")]
    InvalidDigit(char),
}

impl Error {
    /// Create an invalid parameter error
    pub fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }

    /// Create a translation error
    pub fn translation(msg: impl Into<String>) -> Self {
        Self::Translation(msg.into())
    }

    /// Create an invalid tone error
    pub fn invalid_tone(msg: impl Into<String>) -> Self {
        Self::InvalidTone(msg.into())
    }
}
