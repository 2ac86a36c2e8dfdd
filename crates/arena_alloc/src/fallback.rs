use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;

use crate::BlockSource;

/// Page size stand-in for targets without a queryable page size.
pub const fn page_size() -> usize {
    4096
}

pub struct BlockInner {
    ptr: *mut u8,
    len: usize,
}

impl BlockInner {
    pub fn acquire(len: usize, _source: BlockSource) -> io::Result<Self> {
        let len = len.div_ceil(page_size()) * page_size();
        let layout = Layout::from_size_align(len, page_size())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: layout is non-zero sized and validly aligned.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "global allocator refused block",
            ));
        }
        Ok(Self { ptr, len })
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            let layout = Layout::from_size_align(self.len, page_size()).unwrap();
            // SAFETY: allocated with the same layout in `acquire`.
            unsafe { dealloc(self.ptr, layout) };
        }
    }
}
