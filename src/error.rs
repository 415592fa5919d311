use thiserror::Error;

/// Shorter syntax for fallible zone operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong inside a zone. Zones never panic on bad input,
/// they report one of these and leave their state untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Null handle, or a handle that points inside a zone but not at the start
    /// of a slot or block payload.
    #[error("invalid pointer")]
    InvalidPointer,

    /// The address is not inside any region owned by the zone that was asked.
    #[error("pointer out of range")]
    PointerOutOfRange,

    /// Zero sized request, or a request larger than what the zone serves.
    #[error("size {size} rejected")]
    SizeRejected { size: usize },

    /// The kernel could not map a region of `length` bytes.
    #[error("failed to map {length} bytes")]
    MappingFailure { length: usize },

    /// The address is the start of a slot or block that is not in use, which
    /// usually means double free.
    #[error("pointer not found")]
    NotFound,

    /// No free slot or block large enough.
    #[error("zone exhausted")]
    Exhausted,

    /// Configuration rejected by [`crate::Config::validate`].
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
