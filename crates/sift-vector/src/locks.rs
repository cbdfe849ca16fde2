//! Deadline-aware lock acquisition.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use sift_core::deadline::Deadline;
use sift_core::error::{Result, SiftError};

pub(crate) fn read_until<'a, T>(
    lock: &'a RwLock<T>,
    deadline: Deadline,
    operation: &'static str,
) -> Result<RwLockReadGuard<'a, T>> {
    match deadline.instant() {
        None => Ok(lock.read()),
        Some(at) => lock
            .try_read_until(at)
            .ok_or_else(|| SiftError::timeout(operation)),
    }
}

pub(crate) fn write_until<'a, T>(
    lock: &'a RwLock<T>,
    deadline: Deadline,
    operation: &'static str,
) -> Result<RwLockWriteGuard<'a, T>> {
    match deadline.instant() {
        None => Ok(lock.write()),
        Some(at) => lock
            .try_write_until(at)
            .ok_or_else(|| SiftError::timeout(operation)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_write_times_out_under_reader() {
        let lock = RwLock::new(0u32);
        let _reader = lock.read();
        let result = write_until(&lock, Deadline::after(Duration::from_millis(10)), "t");
        assert!(matches!(result, Err(SiftError::Timeout { operation: "t" })));
    }

    #[test]
    fn test_read_shares_with_reader() {
        let lock = RwLock::new(7u32);
        let _reader = lock.read();
        let guard = read_until(&lock, Deadline::after(Duration::from_millis(10)), "t").unwrap();
        assert_eq!(*guard, 7);
    }
}
