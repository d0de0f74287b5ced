use thiserror::Error;

/// Caller-boundary argument validation failure.
///
/// Reported synchronously from [`crate::ConcurrentMap::get`],
/// [`crate::ConcurrentMap::put`], and [`crate::ConcurrentMap::remove`] before
/// any state is touched. Protocol invariant violations (a non-positive key
/// discovered mid-migration, a tombstone migrated as a live value) are bugs,
/// not caller errors, and panic instead of surfacing here.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// `key <= 0`. Keys must be strictly positive.
    #[error("invalid key {0}: keys must be strictly positive")]
    InvalidKey(i32),
    /// `value` outside `[1, i32::MAX)`.
    #[error("invalid value {0}: values must be in [1, i32::MAX)")]
    InvalidValue(i32),
}
