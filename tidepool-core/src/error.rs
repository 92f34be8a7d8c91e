use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Discriminated error kinds shared across the workspace. Transient IO and
/// downstream failures are absorbed by callers and surfaced as metrics; the
/// remaining kinds travel back to the caller as values.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config: {0}")]
    Config(String),
    #[error("invalid span: {0}")]
    InvalidSpan(String),
    #[error("checkpoint not found")]
    CheckpointNotFound,
    #[error("checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),
    #[error("invalid checkpoint: {0}")]
    InvalidCheckpoint(String),
    #[error("downstream: {0}")]
    Downstream(String),
    #[error("lifecycle: {0}")]
    Lifecycle(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub fn invalid_span(msg: impl Into<String>) -> Self {
        Self::InvalidSpan(msg.into())
    }
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CheckpointCorrupt(msg.into())
    }
    pub fn invalid_checkpoint(msg: impl Into<String>) -> Self {
        Self::InvalidCheckpoint(msg.into())
    }
    pub fn downstream(msg: impl Into<String>) -> Self {
        Self::Downstream(msg.into())
    }
    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }
}

// Map TOML deserialization errors into the config error domain without adding a new variant
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
