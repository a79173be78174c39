//! Crate error type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapError {
    /// The requested initial capacity cannot be rounded up to a power of
    /// two without overflowing `usize` arithmetic before clamping to
    /// [`crate::hash::MAXIMUM_CAPACITY`] is even possible.
    #[error("capacity overflow: requested capacity {0} is too large")]
    CapacityOverflow(usize),
}

pub type Result<T> = std::result::Result<T, MapError>;
