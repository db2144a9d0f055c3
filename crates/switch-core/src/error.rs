use thiserror::Error;

/// Switching core errors
#[derive(Error, Debug)]
pub enum SwitchError {
    /// Media layer errors
    #[error("Media error: {0}")]
    Media(#[from] rvoip_media_core::Error),

    /// No channel with that name or id
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// Channel is hung up or being hung up
    #[error("Channel {0} is gone")]
    ChannelGone(String),

    /// A channel with that name is already registered
    #[error("Channel name already in use: {0}")]
    DuplicateName(String),

    /// Masquerade refused before any state changed
    #[error("Masquerade refused: {0}")]
    MasqueradeRefused(String),

    /// Technology driver reported a failure
    #[error("Technology error on {channel}: {message}")]
    Technology { channel: String, message: String },

    /// Technology does not implement the operation
    #[error("{tech} does not support {operation}")]
    Unsupported { tech: String, operation: &'static str },

    /// Generator errors
    #[error("Generator error: {0}")]
    Generator(String),

    /// Bridge refused or failed
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// Feature errors
    #[error("Feature error: {0}")]
    Feature(String),

    /// Parking errors
    #[error("Parking error: {0}")]
    Parking(String),

    /// Pickup errors
    #[error("Pickup error: {0}")]
    Pickup(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchError {
    /// Create a new Technology error
    pub fn technology<C: Into<String>, S: Into<String>>(channel: C, msg: S) -> Self {
        Self::Technology {
            channel: channel.into(),
            message: msg.into(),
        }
    }

    /// Create a new Unsupported error
    pub fn unsupported<S: Into<String>>(tech: S, operation: &'static str) -> Self {
        Self::Unsupported {
            tech: tech.into(),
            operation,
        }
    }

    /// Create a new MasqueradeRefused error
    pub fn masquerade<S: Into<String>>(msg: S) -> Self {
        Self::MasqueradeRefused(msg.into())
    }

    /// Create a new Generator error
    pub fn generator<S: Into<String>>(msg: S) -> Self {
        Self::Generator(msg.into())
    }

    /// Create a new Bridge error
    pub fn bridge<S: Into<String>>(msg: S) -> Self {
        Self::Bridge(msg.into())
    }

    /// Create a new Feature error
    pub fn feature<S: Into<String>>(msg: S) -> Self {
        Self::Feature(msg.into())
    }

    /// Create a new Parking error
    pub fn parking<S: Into<String>>(msg: S) -> Self {
        Self::Parking(msg.into())
    }

    /// Create a new Pickup error
    pub fn pickup<S: Into<String>>(msg: S) -> Self {
        Self::Pickup(msg.into())
    }

    /// Create a new Config error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the error means the channel can no longer be used
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ChannelGone(_) | Self::Technology { .. })
    }
}

/// Result type for switching core operations
pub type Result<T> = std::result::Result<T, SwitchError>;
