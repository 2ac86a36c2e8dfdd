use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::BlockSource;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct BlockInner {
    ptr: *mut libc::c_void,
    len: usize,
    fd: libc::c_int,
}

impl BlockInner {
    pub fn acquire(len: usize, source: BlockSource) -> io::Result<Self> {
        // Round up to whole pages; mmap hands them out anyway.
        let ps = page_size();
        let len = len.div_ceil(ps) * ps;

        let (fd, flags) = match source {
            BlockSource::Anonymous => (-1, libc::MAP_PRIVATE | libc::MAP_ANON),
            BlockSource::ZeroFile => {
                let path = c"/dev/zero";
                let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDONLY) };
                if fd == -1 {
                    return Err(Error::last_os_error());
                }
                (fd, libc::MAP_PRIVATE)
            }
        };

        let prot = libc::PROT_READ | libc::PROT_WRITE;
        let ptr = unsafe { libc::mmap(ptr::null_mut(), len, prot, flags, fd, 0) };

        if ptr == libc::MAP_FAILED {
            let err = Error::last_os_error();
            if fd != -1 {
                unsafe { libc::close(fd) };
            }
            return Err(err);
        }

        Ok(Self { ptr, len, fd })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast()
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
        if self.fd != -1 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
