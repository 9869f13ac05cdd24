//! Lock implementations for use with [`MarlLock`](crate::MarlLock).
//!
//! Use of the `spin` crate's mutex with `MarlLock` is a good default for
//! multi-threaded programs.

/// A dummy RawMutex implementation to skip synchronization on single
/// threaded systems.
///
/// # Safety
/// This performs no locking whatsoever. Undefined behaviour results if two
/// threads ever enter a critical section guarded by it, even without any
/// explicit unsafe code.
pub struct AssumeUnlockable;

// SAFETY: nope
unsafe impl lock_api::RawMutex for AssumeUnlockable {
    const INIT: AssumeUnlockable = AssumeUnlockable;

    // A guard can be sent to another thread and unlocked there
    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {}

    fn try_lock(&self) -> bool {
        true
    }

    unsafe fn unlock(&self) {}
}
