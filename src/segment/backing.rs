//! Segment backings - where the bytes actually come from
//!
//! Design: two backings behind one trait:
//! 1. `HeapRegion` - zeroed process memory (tests, offline image builder)
//! 2. `PosixShm` - named POSIX shared memory mapped with `mmap`

use crate::error::SegmentError;
use std::alloc::{alloc_zeroed, dealloc, Layout};

/// Mapped bytes backing a `Segment`
pub trait Backing: Send + Sync {
    fn as_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;
}

/// Segment alignment; covers every record stored inside
const REGION_ALIGN: usize = 16;

/// Zeroed region from the process heap
pub struct HeapRegion {
    start: *mut u8,
    layout: Layout,
}

impl HeapRegion {
    pub fn new(size: usize) -> Result<Self, SegmentError> {
        if size == 0 || size >= u32::MAX as usize {
            return Err(SegmentError::InvalidSize(size));
        }
        let layout =
            Layout::from_size_align(size, REGION_ALIGN).map_err(|_| SegmentError::InvalidSize(size))?;

        let start = unsafe { alloc_zeroed(layout) };
        if start.is_null() {
            return Err(SegmentError::InvalidSize(size));
        }

        Ok(Self { start, layout })
    }
}

impl Backing for HeapRegion {
    #[inline]
    fn as_ptr(&self) -> *mut u8 {
        self.start
    }

    #[inline]
    fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.start, self.layout);
        }
    }
}

// Safety: the region is owned exclusively and only reached through Segment
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

#[cfg(unix)]
pub use posix::PosixShm;

#[cfg(unix)]
mod posix {
    use super::Backing;
    use crate::error::SegmentError;
    use crate::logging::{debug, warn};
    use std::ffi::CString;
    use std::io;

    /// Named POSIX shared memory object mapped into this process
    ///
    /// The creating process unlinks the name on drop. A server that crashes
    /// never drops, so the object survives for the next server to re-attach.
    pub struct PosixShm {
        name: CString,
        ptr: *mut u8,
        len: usize,
        fd: libc::c_int,
        owner: bool,
    }

    fn c_name(name: &str) -> Result<CString, SegmentError> {
        if !name.starts_with('/') || name.len() < 2 || name[1..].contains('/') {
            return Err(SegmentError::InvalidName(name.to_string()));
        }
        CString::new(name).map_err(|_| SegmentError::InvalidName(name.to_string()))
    }

    impl PosixShm {
        /// Create a new object; `AlreadyExists` if the name is taken
        pub fn create(name: &str, size: usize) -> Result<Self, SegmentError> {
            if size == 0 || size >= u32::MAX as usize {
                return Err(SegmentError::InvalidSize(size));
            }
            let cname = c_name(name)?;

            let fd = unsafe {
                libc::shm_open(
                    cname.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    0o600 as libc::mode_t,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EEXIST) {
                    return Err(SegmentError::AlreadyExists(name.to_string()));
                }
                return Err(SegmentError::Create { name: name.to_string(), source: err });
            }

            if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(cname.as_ptr());
                }
                return Err(SegmentError::Create { name: name.to_string(), source: err });
            }

            match map(fd, size, true) {
                Ok(ptr) => {
                    debug!(segment = name, size, "created shared memory object");
                    Ok(Self { name: cname, ptr, len: size, fd, owner: true })
                }
                Err(source) => {
                    unsafe {
                        libc::close(fd);
                        libc::shm_unlink(cname.as_ptr());
                    }
                    Err(SegmentError::Map { name: name.to_string(), source })
                }
            }
        }

        /// Attach to an existing object, sized from the object itself
        ///
        /// A writable attach takes over ownership of the name (crash recovery).
        pub fn attach(name: &str, writable: bool) -> Result<Self, SegmentError> {
            let cname = c_name(name)?;
            let flags = if writable { libc::O_RDWR } else { libc::O_RDONLY };

            let fd = unsafe { libc::shm_open(cname.as_ptr(), flags, 0 as libc::mode_t) };
            if fd < 0 {
                return Err(SegmentError::Attach {
                    name: name.to_string(),
                    source: io::Error::last_os_error(),
                });
            }

            let mut stat: libc::stat = unsafe { core::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut stat) } != 0 {
                let source = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                return Err(SegmentError::Attach { name: name.to_string(), source });
            }
            let len = stat.st_size as usize;
            if len == 0 {
                unsafe { libc::close(fd) };
                return Err(SegmentError::InvalidSize(0));
            }

            match map(fd, len, writable) {
                Ok(ptr) => {
                    debug!(segment = name, size = len, writable, "attached shared memory object");
                    Ok(Self { name: cname, ptr, len, fd, owner: writable })
                }
                Err(source) => {
                    unsafe { libc::close(fd) };
                    Err(SegmentError::Map { name: name.to_string(), source })
                }
            }
        }

        /// Remove a leftover object by name; missing objects are not an error
        pub fn unlink(name: &str) -> Result<(), SegmentError> {
            let cname = c_name(name)?;
            if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(SegmentError::Attach { name: name.to_string(), source: err });
                }
            }
            Ok(())
        }
    }

    fn map(fd: libc::c_int, len: usize, writable: bool) -> io::Result<*mut u8> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        let ptr = unsafe {
            libc::mmap(core::ptr::null_mut(), len, prot, libc::MAP_SHARED, fd, 0)
        };
        if ptr == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(ptr as *mut u8)
        }
    }

    impl Backing for PosixShm {
        #[inline]
        fn as_ptr(&self) -> *mut u8 {
            self.ptr
        }

        #[inline]
        fn len(&self) -> usize {
            self.len
        }
    }

    impl Drop for PosixShm {
        fn drop(&mut self) {
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
                libc::close(self.fd);
                if self.owner && libc::shm_unlink(self.name.as_ptr()) != 0 {
                    warn!(
                        segment = ?self.name,
                        error = %io::Error::last_os_error(),
                        "failed to unlink shared memory object"
                    );
                }
            }
        }
    }

    // Safety: the mapping lives until drop; access is mediated by Segment
    unsafe impl Send for PosixShm {}
    unsafe impl Sync for PosixShm {}
}
