// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that recover from poisoning.
//!
//! A listener callback or a download task may panic while the job map is
//! locked. The manager keeps serving the remaining jobs instead of turning
//! every later request into a panic, so poisoned guards are recovered and the
//! event is logged.
//!
//! ```no_run
//! use std::sync::RwLock;
//! use modelvault::locks;
//!
//! let jobs = RwLock::new(Vec::<String>::new());
//! locks::write(&jobs).push("a1b2".to_string());
//! assert_eq!(locks::read(&jobs).len(), 1);
//! ```

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read guard, recovering it if the lock is poisoned.
#[inline]
pub fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modelvault::locks",
                event = "LOCK_POISONED_READ",
                "RwLock poisoned during read; recovering guard"
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write guard, recovering it if the lock is poisoned.
#[inline]
pub fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "modelvault::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock poisoned during write; recovering guard"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_read_and_write_normal() {
        let lock = RwLock::new(1);
        *write(&lock) = 2;
        assert_eq!(*read(&lock), 2);
    }

    #[test]
    fn test_write_recovers_poisoned_lock() {
        let lock = Arc::new(RwLock::new(vec![1]));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.write().unwrap();
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        write(&lock).push(2);
        assert_eq!(*read(&lock), vec![1, 2]);
    }
}
