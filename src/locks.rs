// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-recovering lock acquisition.
//!
//! The pull registry is read by status pollers while orchestrator tasks
//! write progress. If a writer panics mid-update the lock is poisoned;
//! recovering the guard keeps pollers alive instead of cascading the
//! panic through every status read. The event is logged so the original
//! panic can be investigated.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "depot::locks",
                "RwLock poisoned during read acquisition; recovering. \
                 A thread panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "depot::locks",
                "RwLock poisoned during write acquisition; recovering. \
                 A thread panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering from poisoning if necessary.
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "depot::locks",
                "Mutex poisoned during acquisition; recovering. \
                 A thread panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::RwLock;

    #[test]
    fn test_normal_read_write() {
        let lock = RwLock::new(42);
        {
            let mut guard = resilient_write(&lock);
            *guard = 100;
        }
        let guard = resilient_read(&lock);
        assert_eq!(*guard, 100);
    }

    #[test]
    fn test_recovers_from_poison() {
        let lock = std::sync::Arc::new(RwLock::new(1));
        let lock2 = lock.clone();

        let _ = std::thread::spawn(move || {
            let _guard = lock2.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(lock.is_poisoned());
        let guard = resilient_read(&lock);
        assert_eq!(*guard, 1);
    }
}
