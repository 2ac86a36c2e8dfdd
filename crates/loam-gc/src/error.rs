//! Error types for the collector.

use thiserror::Error;

/// Recoverable collector errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The backing allocator could not satisfy an arena request even after a
    /// collection cycle ran at the minimum growth size.
    #[error("failed to allocate memory")]
    OutOfMemory,

    /// An object identity did not decode to a live, in-arena object.
    #[error("0x{0:x} is not a valid identity value")]
    InvalidReference(u64),
}

/// Result type alias for collector operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Abort on a heap-integrity violation.
///
/// Mark and sweep treat an inconsistent slot encoding as corruption and stop
/// rather than continue over a damaged heap.
macro_rules! corrupt_heap {
    ($($arg:tt)*) => {
        panic!("heap corruption: {}", format_args!($($arg)*))
    };
}

pub(crate) use corrupt_heap;
