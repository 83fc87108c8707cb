//! Mutex injection.
//!
//! The heap serializes every external operation on one lock whose type is
//! chosen at compile time. The default is the `parking_lot` raw mutex;
//! [`SingleThreaded`] swaps in a no-op with the same two operations so
//! the allocator code is identical either way.

use parking_lot::lock_api::{GuardSend, RawMutex};

/// The thread-safe default lock.
pub type DefaultMutex = parking_lot::RawMutex;

/// No-op lock for single-threaded use.
///
/// Acquire and release do nothing. The caller takes over the exclusion
/// guarantee: a heap locked by this type must only ever be touched from
/// one thread.
pub struct SingleThreaded {
    _priv: (),
}

// SAFETY: exclusion is delegated to the caller per the type's contract.
unsafe impl RawMutex for SingleThreaded {
    const INIT: Self = Self { _priv: () };

    type GuardMarker = GuardSend;

    #[inline]
    fn lock(&self) {}

    #[inline]
    fn try_lock(&self) -> bool {
        true
    }

    #[inline]
    unsafe fn unlock(&self) {}
}
