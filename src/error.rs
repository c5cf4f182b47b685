//! Error types surfaced by the storage engine core.
//!
//! Every fallible operation returns a `Result<T, EngineError>` rather than
//! panicking; callers are expected to match on the variant to decide how to
//! respond on the wire.

use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors a shard worker can return from an operation.
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// The key was not live at the moment of the operation.
    #[error("key not found")]
    KeyNotFound,

    /// ADD failed because the key already has a live value.
    #[error("key already exists")]
    KeyExists,

    /// CAS witness did not match the key's current cas.
    #[error("cas mismatch")]
    CasMismatch,

    /// Key byte length exceeded `KEY_MAX_LEN`.
    #[error("key too large")]
    KeyTooLarge,

    /// Value byte length exceeded the largest bucket's capacity.
    #[error("value too large")]
    ValueTooLarge,

    /// INCR/DECR target was not a plain ASCII decimal u64.
    #[error("value is not numeric")]
    NotNumeric,

    /// A stored record failed to parse; distinct from `Io` so recovery can
    /// skip it without treating it as an OS-level failure.
    #[error("corrupt on-disk record: {0}")]
    Corrupt(&'static str),

    /// A read, write, fsync, or truncate against shard storage failed.
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// True for the class of failures callers generally classify as
    /// `StorageIo` per the spec's error taxonomy (as opposed to semantic
    /// rejections like `KeyNotFound` or `ValueTooLarge`).
    pub fn is_storage_io(&self) -> bool {
        matches!(self, EngineError::Io(_) | EngineError::Corrupt(_))
    }
}
