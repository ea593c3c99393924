// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Blocking mutex, built on a wait queue.
//!
//! Unlike a spinlock, taking one of these is a suspension point, so mutexes
//! may protect operations that allocate or walk page tables. The banked
//! wakeup in the wait queue closes the gap between observing the mutex held
//! and going to sleep.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::spinlock::IrqSpinlock;
use crate::waitq::{SleepFlags, WaitQueue};

pub struct Mutex<T> {
    held: IrqSpinlock<bool>,
    wq: WaitQueue,
    value: UnsafeCell<T>,
}

// Safety: the mutex serializes all access to the inner value.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Mutex {
            held: IrqSpinlock::new(false),
            wq: WaitQueue::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the mutex, sleeping while it is held elsewhere.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            {
                let mut held = self.held.lock();
                if !*held {
                    *held = true;
                    return MutexGuard { mutex: self };
                }
            }
            let _ = self.wq.sleep_timeout(0, SleepFlags::empty());
        }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut held = self.held.lock();
        if *held {
            None
        } else {
            *held = true;
            Some(MutexGuard { mutex: self })
        }
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: we hold the mutex.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the mutex.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        *self.mutex.held.lock() = false;
        self.mutex.wq.wake_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_lock_does_not_sleep() {
        let m = Mutex::new(3);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 4);
    }

    #[test]
    fn try_lock_respects_the_holder() {
        let m = Mutex::new(());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }
}
