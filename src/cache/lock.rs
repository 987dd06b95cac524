//! Cache lock - one binary semaphore for all three dynamic collections
//!
//! Design: two implementations behind `CacheLock`:
//! 1. `NamedSemaphore` - POSIX named semaphore shared by server and clients
//! 2. `LocalLock` - in-process binary semaphore that counts acquisitions

use crate::config::Role;
use crate::error::LockError;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Blocking binary semaphore
pub trait CacheLock: Send + Sync {
    /// Block until the lock is held by the caller
    fn acquire(&self);

    fn release(&self);
}

/// Holds a `CacheLock` until dropped
pub struct CacheGuard<'a> {
    lock: &'a dyn CacheLock,
}

impl<'a> CacheGuard<'a> {
    pub fn new(lock: &'a dyn CacheLock) -> Self {
        lock.acquire();
        Self { lock }
    }
}

impl Drop for CacheGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

struct LocalState {
    held: Mutex<bool>,
    released: Condvar,
    acquisitions: AtomicUsize,
}

/// In-process binary semaphore; clones share the same state
#[derive(Clone)]
pub struct LocalLock {
    state: Arc<LocalState>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self {
            state: Arc::new(LocalState {
                held: Mutex::new(false),
                released: Condvar::new(),
                acquisitions: AtomicUsize::new(0),
            }),
        }
    }

    /// Times the lock was taken since creation
    pub fn acquisitions(&self) -> usize {
        self.state.acquisitions.load(Ordering::Relaxed)
    }
}

impl Default for LocalLock {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheLock for LocalLock {
    fn acquire(&self) {
        let mut held = self.state.held.lock();
        while *held {
            self.state.released.wait(&mut held);
        }
        *held = true;
        self.state.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) {
        *self.state.held.lock() = false;
        self.state.released.notify_one();
    }
}

#[cfg(unix)]
pub use posix::NamedSemaphore;

#[cfg(unix)]
mod posix {
    use super::CacheLock;
    use crate::config::is_platform_name;
    use crate::error::LockError;
    use crate::logging::{debug, error};
    use std::ffi::CString;
    use std::io;

    /// POSIX named semaphore with an initial count of one
    pub struct NamedSemaphore {
        sem: *mut libc::sem_t,
    }

    // Safety: sem_wait/sem_post are thread-safe on a shared handle
    unsafe impl Send for NamedSemaphore {}
    unsafe impl Sync for NamedSemaphore {}

    fn c_name(name: &str) -> Result<CString, LockError> {
        if !is_platform_name(name) {
            return Err(LockError::InvalidName(name.to_string()));
        }
        CString::new(name).map_err(|_| LockError::InvalidName(name.to_string()))
    }

    impl NamedSemaphore {
        /// Server side: open or create the semaphore and reset its count to one
        ///
        /// Clients attached to a previous server keep the same semaphore, so
        /// it is reused rather than replaced.
        pub fn create(name: &str) -> Result<Self, LockError> {
            let c = c_name(name)?;
            let sem = unsafe {
                libc::sem_open(
                    c.as_ptr(),
                    libc::O_CREAT,
                    0o600 as libc::c_uint,
                    1 as libc::c_uint,
                )
            };
            if sem == libc::SEM_FAILED {
                return Err(LockError::Create {
                    name: name.to_string(),
                    source: io::Error::last_os_error(),
                });
            }
            // a crashed server may have left it held
            let mut drained = 0usize;
            while unsafe { libc::sem_trywait(sem) } == 0 {
                drained += 1;
            }
            if unsafe { libc::sem_post(sem) } != 0 {
                let source = io::Error::last_os_error();
                unsafe { libc::sem_close(sem) };
                return Err(LockError::Create {
                    name: name.to_string(),
                    source,
                });
            }
            debug!(semaphore = name, drained, "cache semaphore ready");
            Ok(Self { sem })
        }

        /// Remove the name; open handles stay usable, a missing name is not an error
        pub fn unlink(name: &str) -> Result<(), LockError> {
            let c = c_name(name)?;
            if unsafe { libc::sem_unlink(c.as_ptr()) } != 0 {
                let source = io::Error::last_os_error();
                if source.raw_os_error() != Some(libc::ENOENT) {
                    return Err(LockError::Open { name: name.to_string(), source });
                }
            }
            Ok(())
        }

        /// Client side: open the semaphore the server created
        pub fn open(name: &str) -> Result<Self, LockError> {
            let c = c_name(name)?;
            let sem = unsafe { libc::sem_open(c.as_ptr(), 0) };
            if sem == libc::SEM_FAILED {
                return Err(LockError::Open {
                    name: name.to_string(),
                    source: io::Error::last_os_error(),
                });
            }
            debug!(semaphore = name, "cache semaphore opened");
            Ok(Self { sem })
        }
    }

    impl CacheLock for NamedSemaphore {
        fn acquire(&self) {
            loop {
                if unsafe { libc::sem_wait(self.sem) } == 0 {
                    return;
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    error!(error = %err, "sem_wait failed");
                    return;
                }
            }
        }

        fn release(&self) {
            if unsafe { libc::sem_post(self.sem) } != 0 {
                error!(error = %io::Error::last_os_error(), "sem_post failed");
            }
        }
    }

    impl Drop for NamedSemaphore {
        fn drop(&mut self) {
            // clients may still be attached, so the name is left in place
            unsafe {
                libc::sem_close(self.sem);
            }
        }
    }
}

/// The platform lock for `role`: the server creates it, clients open it
#[cfg(unix)]
pub fn open_lock(name: &str, role: Role) -> Result<Box<dyn CacheLock>, LockError> {
    let lock = match role {
        Role::Server => NamedSemaphore::create(name)?,
        Role::Client => NamedSemaphore::open(name)?,
    };
    Ok(Box::new(lock))
}

#[cfg(not(unix))]
pub fn open_lock(_name: &str, _role: Role) -> Result<Box<dyn CacheLock>, LockError> {
    Err(LockError::Unsupported)
}
