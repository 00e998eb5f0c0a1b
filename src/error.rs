//! Error types for tiered storage operations.
//!
//! Capacity refusal and deletion races are not errors: migration reports
//! them as `Ok(false)`. Everything here is a fault the caller must see.

use crate::tier::Tier;

/// Errors that can occur while opening, migrating or deleting segments.
#[derive(Debug, thiserror::Error)]
pub enum TierError {
    /// Backend I/O fault (disk error, permission, corruption).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The logical path is not of the form `namespace/<id>.<ext>`.
    #[error("invalid segment path: {0}")]
    InvalidPath(String),

    /// Every root of a directory pool reports zero free space.
    #[error("no free space in any of {0} directories")]
    NoFreeSpace(usize),

    /// I/O was attempted on a deleted channel.
    #[error("channel deleted")]
    Deleted,

    /// I/O was attempted on a closed channel.
    #[error("channel closed")]
    Closed,

    /// No backend is configured for the requested tier.
    #[error("no backend configured for tier {0}")]
    NoBackend(Tier),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The metadata store rejected a write.
    #[error("metadata store error: {0}")]
    Metadata(String),
}

/// Result type for tiered storage operations.
pub type TierResult<T> = Result<T, TierError>;
