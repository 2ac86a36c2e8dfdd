//! Raw memory blocks for object arenas.
//!
//! The collector obtains each arena as one contiguous block from this crate
//! and returns it wholesale when the arena is retired. On Unix the block is
//! an anonymous private mapping; everywhere else it falls back to the global
//! allocator. Blocks can optionally be backed by a mapping of `/dev/zero`,
//! which makes the bytes an arena dirties visible to external memory
//! inspection tools (each dirtied page shows up as a private copy).

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(not(unix))]
mod fallback;
#[cfg(not(unix))]
use fallback as os;

pub use os::page_size;

/// How the backing memory of a [`Block`] is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockSource {
    /// Anonymous mapping (or `std::alloc` on non-Unix targets).
    #[default]
    Anonymous,
    /// A private mapping of `/dev/zero`. Unix only; falls back to
    /// [`BlockSource::Anonymous`] elsewhere.
    ZeroFile,
}

/// A block of raw memory holding one arena.
///
/// The memory is zero-initialized, readable and writable, and released when
/// the handle is dropped. The block never moves.
pub struct Block {
    inner: os::BlockInner,
}

impl Block {
    /// Acquire a block of at least `len` bytes.
    ///
    /// Returns an error when the operating system cannot supply the memory;
    /// the caller decides whether that is fatal.
    pub fn acquire(len: usize, source: BlockSource) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "block length must be greater than 0",
            ));
        }
        Ok(Self {
            inner: os::BlockInner::acquire(len, source)?,
        })
    }

    /// Pointer to the start of the block.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length of the block in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the block is empty. Always false for acquired blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

// SAFETY: The block is a plain region of process memory; the handle owns it
// exclusively and nothing in it is thread-affine.
unsafe impl Send for Block {}

#[cfg(test)]
mod tests {
    use super::{page_size, Block, BlockSource};
    use std::ptr;

    #[test]
    fn page_size_is_a_power_of_two() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0);
    }

    #[test]
    fn acquire_zeroed_and_writable() {
        let block = Block::acquire(page_size() * 4, BlockSource::Anonymous).unwrap();
        assert!(block.len() >= page_size() * 4);
        let p = block.ptr();
        assert!(!p.is_null());
        unsafe {
            assert_eq!(ptr::read_volatile(p), 0);
            ptr::write_volatile(p, 0xAB);
            assert_eq!(ptr::read_volatile(p), 0xAB);
            let last = p.add(block.len() - 1);
            ptr::write_volatile(last, 0xCD);
            assert_eq!(ptr::read_volatile(last), 0xCD);
        }
    }

    #[test]
    fn acquire_zero_len_is_an_error() {
        assert!(Block::acquire(0, BlockSource::Anonymous).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn acquire_file_backed() {
        let block = Block::acquire(page_size(), BlockSource::ZeroFile).unwrap();
        let p = block.ptr();
        unsafe {
            assert_eq!(ptr::read_volatile(p), 0);
            ptr::write_volatile(p, 7);
            assert_eq!(ptr::read_volatile(p), 7);
        }
    }
}
