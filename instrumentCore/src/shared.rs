//! A transport that several cooperating callers share.
//!
//! Drivers hand clones of a [`SharedInterface`] to channels or threads. Every request/response
//! sequence takes a scoped hold on the interface, so at most one logical request is in flight at
//! any time. Waiting for the hold is bounded by a timeout.

use std::{sync::Arc, time::Duration};

use parking_lot::{Mutex, MutexGuard};

use crate::{InstrumentError, InstrumentInterface};

/// Guard of a scoped hold on a [`SharedInterface`]. The hold is released when the guard is
/// dropped.
pub type InterfaceHold<'a, T> = MutexGuard<'a, T>;

/// An instrument interface wrapped for shared use.
///
/// Cloning is cheap, as it only increases the reference count of the inner `Arc`.
pub struct SharedInterface<T: InstrumentInterface> {
    inner: Arc<Mutex<T>>,
}

impl<T: InstrumentInterface> SharedInterface<T> {
    /// Wrap an interface for shared use.
    pub fn new(interface: T) -> Self {
        SharedInterface {
            inner: Arc::new(Mutex::new(interface)),
        }
    }

    /// Take the scoped hold on the interface.
    ///
    /// Returns [`InstrumentError::LockTimeout`] if another caller keeps the interface for longer
    /// than `timeout`.
    pub fn hold(&self, timeout: Duration) -> Result<InterfaceHold<'_, T>, InstrumentError> {
        self.inner.try_lock_for(timeout).ok_or_else(|| {
            log::warn!("Interface hold not acquired within {timeout:?}");
            InstrumentError::LockTimeout(timeout)
        })
    }

    /// Returns `true` if somebody currently holds the interface.
    pub fn is_held(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T: InstrumentInterface> Clone for SharedInterface<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Instrument;
    use std::collections::VecDeque;

    fn shared() -> SharedInterface<Instrument<VecDeque<u8>>> {
        SharedInterface::new(Instrument::new(VecDeque::new(), Duration::from_secs(1)))
    }

    #[test]
    fn test_hold_released_on_drop() {
        let intf = shared();
        {
            let _hold = intf.hold(Duration::from_millis(10)).unwrap();
            assert!(intf.is_held());
        }
        assert!(!intf.is_held());
        assert!(intf.hold(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_hold_times_out() {
        let intf = shared();
        let other = intf.clone();
        let _hold = intf.hold(Duration::from_millis(10)).unwrap();
        match other.hold(Duration::from_millis(20)) {
            Err(InstrumentError::LockTimeout(timeout)) => {
                assert_eq!(timeout, Duration::from_millis(20))
            }
            _ => panic!("Expected a lock timeout."),
        }
    }
}
