//! Mynewt style mutex on top of an RTOS mutex primitive.
//!
//! FCB serializes access to its flash area with `os_mutex_init`,
//! `os_mutex_pend` and `os_mutex_release`. [`OsMutex`] provides the same
//! contract, including its error vocabulary, for any [`Kernel`].

use crate::utils::NameBuf;
use core::fmt::{self, Write};
#[cfg(target_has_atomic = "32")]
use core::sync::atomic::{AtomicU32, Ordering};

/// Time in OS ticks.
pub type OsTime = u32;

/// Timeout value that waits forever.
pub const OS_TIMEOUT_NEVER: OsTime = u32::MAX;

/// Prefix of the kernel object name of every mutex.
pub const MUTEX_NAME_PREFIX: &str = "fcb2_lock";

#[cfg(target_has_atomic = "32")]
static NEXT_MUTEX: AtomicU32 = AtomicU32::new(0);

/// Process-wide mutex sequence number.
///
/// Targets without atomic read-modify-write (thumbv6m) get 0 every time and
/// have to override [`Kernel::next_mutex_seq`] if they create more than one
/// mutex.
#[cfg(target_has_atomic = "32")]
fn next_seq() -> u32 {
    NEXT_MUTEX.fetch_add(1, Ordering::Relaxed)
}

#[cfg(not(target_has_atomic = "32"))]
fn next_seq() -> u32 {
    0
}

/// Order in which blocked tasks acquire a mutex.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WaitType {
    /// Highest priority waiter first.
    Priority,
    /// First come, first served.
    Fifo,
}

/// The RTOS mutex primitive.
pub trait Kernel {
    /// Handle of a kernel mutex.
    type Handle: Copy;
    /// Error reported by the kernel.
    type Error: fmt::Debug;

    /// Creates a mutex named `name`.
    fn mutex_create(&self, name: &str, wait: WaitType) -> Result<Self::Handle, Self::Error>;

    /// Locks the mutex, waiting at most `timeout` ticks.
    ///
    /// A timeout of 0 does not wait, [`OS_TIMEOUT_NEVER`] waits forever.
    fn mutex_lock(&self, mutex: Self::Handle, timeout: OsTime) -> Result<(), Self::Error>;

    /// Unlocks a mutex held by the calling task.
    fn mutex_unlock(&self, mutex: Self::Handle) -> Result<(), Self::Error>;

    /// Sequence number for the name of the next mutex.
    ///
    /// Defaults to a process-wide counter. Kernels that can hand out unique
    /// numbers themselves, for example from inside a critical section, should
    /// override this.
    fn next_mutex_seq(&self) -> u32 {
        next_seq()
    }
}

impl<K: Kernel + ?Sized> Kernel for &K {
    type Handle = K::Handle;
    type Error = K::Error;

    fn mutex_create(&self, name: &str, wait: WaitType) -> Result<Self::Handle, Self::Error> {
        (**self).mutex_create(name, wait)
    }

    fn mutex_lock(&self, mutex: Self::Handle, timeout: OsTime) -> Result<(), Self::Error> {
        (**self).mutex_lock(mutex, timeout)
    }

    fn mutex_unlock(&self, mutex: Self::Handle) -> Result<(), Self::Error> {
        (**self).mutex_unlock(mutex)
    }

    fn next_mutex_seq(&self) -> u32 {
        (**self).next_mutex_seq()
    }
}

/// Mutex errors, using the Mynewt `os_error_t` values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OsError {
    /// The mutex is not initialized, or could not be created.
    InvalidParm,
    /// The calling task does not own the mutex.
    BadMutex,
    /// The mutex could not be acquired in time.
    Timeout,
}

impl OsError {
    /// The numeric `os_error_t` value.
    pub fn code(self) -> i32 {
        match self {
            OsError::InvalidParm => 3,
            OsError::BadMutex => 5,
            OsError::Timeout => 6,
        }
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsError::InvalidParm => f.write_str("invalid parameter"),
            OsError::BadMutex => f.write_str("mutex not owned by the calling task"),
            OsError::Timeout => f.write_str("timed out waiting for mutex"),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl std::error::Error for OsError {}

/// A mutex as used by FCB.
///
/// Starts out uninitialized; every operation on an uninitialized mutex fails
/// with [`OsError::InvalidParm`].
pub struct OsMutex<K: Kernel> {
    kernel: K,
    id: Option<K::Handle>,
}

impl<K: Kernel> OsMutex<K> {
    /// Creates an uninitialized mutex backed by `kernel`.
    pub fn new(kernel: K) -> Self {
        OsMutex { kernel, id: None }
    }

    /// Whether [`init`](OsMutex::init) has succeeded.
    pub fn is_initialized(&self) -> bool {
        self.id.is_some()
    }

    /// Creates the kernel mutex.
    ///
    /// Each mutex gets its own kernel object name, with priority ordered
    /// waiters.
    pub fn init(&mut self) -> Result<(), OsError> {
        let mut name = NameBuf::new();
        let n = self.kernel.next_mutex_seq();
        write!(name, "{}.{}", MUTEX_NAME_PREFIX, n).map_err(|_| OsError::InvalidParm)?;

        match self.kernel.mutex_create(name.as_str(), WaitType::Priority) {
            Ok(id) => {
                debug!("OsMutex::init: created {}", name.as_str());
                self.id = Some(id);
                Ok(())
            }
            Err(e) => {
                error!("OsMutex::init: creating {} failed: {:?}", name.as_str(), e);
                Err(OsError::InvalidParm)
            }
        }
    }

    /// Waits up to `timeout` ticks for the mutex.
    ///
    /// A timeout of 0 polls, [`OS_TIMEOUT_NEVER`] waits forever. Locking is
    /// recursive if the kernel's mutex is.
    pub fn pend(&self, timeout: OsTime) -> Result<(), OsError> {
        let id = self.id.ok_or(OsError::InvalidParm)?;
        self.kernel.mutex_lock(id, timeout).map_err(|e| {
            trace!("OsMutex::pend: {:?}", e);
            OsError::Timeout
        })
    }

    /// Releases the mutex.
    ///
    /// This unlocks, it does not destroy the kernel object.
    pub fn release(&self) -> Result<(), OsError> {
        let id = self.id.ok_or(OsError::InvalidParm)?;
        self.kernel.mutex_unlock(id).map_err(|e| {
            trace!("OsMutex::release: {:?}", e);
            OsError::BadMutex
        })
    }
}

impl<K: Kernel> fmt::Debug for OsMutex<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsMutex")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
