// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel backend for userspace futexes.
//!
//! Futex objects live in a global table keyed by the *physical* address of
//! the userspace word, so the same page mapped into different address
//! spaces shares one wait queue. Each task caches the futexes it has
//! touched by virtual address; every cache entry holds one reference on the
//! kernel object, and the object is freed when the last referencing task
//! drops out.
//!
//! Lock order: the global table's mutex is taken before any task's cache
//! mutex.

use abi::{ErrorCode, Sysarg, EOK};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::arch;
use crate::mutex::Mutex;
use crate::spinlock::IrqSpinlock;
use crate::task::{self, Task};
use crate::waitq::{SleepFlags, SleepResult, WaitQueue};

pub struct Futex {
    /// Physical address of the userspace word; the table key.
    pub paddr: Sysarg,
    pub wq: WaitQueue,
    /// Number of distinct (task, virtual address) pairs referencing this
    /// futex. Mutated only while the global table mutex is held.
    refs: IrqSpinlock<usize>,
}

static FUTEX_HT: Mutex<BTreeMap<Sysarg, Arc<Futex>>> =
    Mutex::new(BTreeMap::new());

/// Resolves `uaddr` in `task` to its kernel futex, creating and caching as
/// needed. `None` means the address has no physical mapping.
fn get_futex(task: &Arc<Task>, uaddr: Sysarg) -> Option<Arc<Futex>> {
    if let Some(futex) = task.futexes.lock().get(&uaddr) {
        return Some(Arc::clone(futex));
    }

    let paddr = arch::virt_to_phys(task.as_id(), uaddr)?;

    let mut table = FUTEX_HT.lock();
    let mut cache = task.futexes.lock();
    // Another thread of this task may have filled the cache while we were
    // translating; its entry already counts our reference.
    if let Some(futex) = cache.get(&uaddr) {
        return Some(Arc::clone(futex));
    }
    let futex = match table.get(&paddr) {
        Some(existing) => {
            *existing.refs.lock() += 1;
            Arc::clone(existing)
        }
        None => {
            let futex = Arc::new(Futex {
                paddr,
                wq: WaitQueue::new(),
                refs: IrqSpinlock::new(1),
            });
            table.insert(paddr, Arc::clone(&futex));
            futex
        }
    };
    cache.insert(uaddr, Arc::clone(&futex));
    Some(futex)
}

/// Drops one reference, retiring the table entry at zero. Caller holds the
/// table mutex.
fn release_ref(table: &mut BTreeMap<Sysarg, Arc<Futex>>, futex: &Arc<Futex>) {
    let remaining = {
        let mut refs = futex.refs.lock();
        uassert!(*refs > 0);
        *refs -= 1;
        *refs
    };
    if remaining == 0 {
        table.remove(&futex.paddr);
    }
}

/// Releases every futex reference held by `task`'s cache. Runs when the
/// task's last thread is on its way out.
pub fn task_cleanup(task: &Arc<Task>) {
    let mut table = FUTEX_HT.lock();
    let mut cache = task.futexes.lock();
    let entries: alloc::vec::Vec<Arc<Futex>> =
        core::mem::take(&mut *cache).into_values().collect();
    for futex in &entries {
        release_ref(&mut table, futex);
    }
}

/// Sleep on the futex word at `uaddr` in the current task.
pub fn sys_futex_sleep(uaddr: Sysarg) -> Sysarg {
    let Some(task) = task::current_task() else {
        return ErrorCode::ENOENT.as_word();
    };
    let Some(futex) = get_futex(&task, uaddr) else {
        return ErrorCode::ENOENT.as_word();
    };
    match futex.wq.sleep_timeout(0, SleepFlags::INTERRUPTIBLE) {
        SleepResult::Ok => EOK,
        r => r.error().unwrap().as_word(),
    }
}

/// Wake at most one sleeper on the futex word at `uaddr`.
pub fn sys_futex_wakeup(uaddr: Sysarg) -> Sysarg {
    let Some(task) = task::current_task() else {
        return ErrorCode::ENOENT.as_word();
    };
    let Some(futex) = get_futex(&task, uaddr) else {
        return ErrorCode::ENOENT.as_word();
    };
    futex.wq.wake_one();
    EOK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::PAGE_SIZE;
    use crate::testsupport;

    fn table_has(paddr: Sysarg) -> bool {
        FUTEX_HT.lock().contains_key(&paddr)
    }

    #[test]
    fn unmapped_addresses_yield_no_futex() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let task = testsupport::make_task();
        assert!(get_futex(&task, 0x7000_0040).is_none());
    }

    #[test]
    fn tasks_sharing_a_physical_page_share_the_futex() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let a = testsupport::make_task();
        let b = testsupport::make_task();

        // The same frame appears at different addresses in each task.
        let frame: Sysarg = 0x0030_0000;
        arch::map_page(a.as_id(), 0x1000_0000, frame);
        arch::map_page(b.as_id(), 0x2000_0000, frame);

        let fa = get_futex(&a, 0x1000_0000 + 0x40).unwrap();
        let fb = get_futex(&b, 0x2000_0000 + 0x40).unwrap();
        assert!(Arc::ptr_eq(&fa, &fb));
        assert_eq!(fa.paddr, frame + 0x40);
        assert_eq!(*fa.refs.lock(), 2);

        task_cleanup(&a);
        assert!(table_has(frame + 0x40));
        task_cleanup(&b);
        assert!(!table_has(frame + 0x40));
    }

    #[test]
    fn repeated_lookups_hit_the_cache_without_new_references() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let task = testsupport::make_task();
        let frame: Sysarg = 0x0031_0000;
        arch::map_page(task.as_id(), 0x1100_0000, frame);

        let f1 = get_futex(&task, 0x1100_0000 + 8).unwrap();
        let f2 = get_futex(&task, 0x1100_0000 + 8).unwrap();
        assert!(Arc::ptr_eq(&f1, &f2));
        assert_eq!(*f1.refs.lock(), 1);

        // Distinct words on one page are distinct futexes.
        let f3 = get_futex(&task, 0x1100_0000 + 16).unwrap();
        assert!(!Arc::ptr_eq(&f1, &f3));

        task_cleanup(&task);
        assert!(!table_has(frame + 8));
        assert!(!table_has(frame + 16));
    }

    #[test]
    fn wakeup_then_sleep_completes_without_blocking() {
        let _g = testsupport::serialize();
        testsupport::boot(1);

        let waker_task = testsupport::make_task();
        let sleeper_task = testsupport::make_task();
        let frame: Sysarg = 0x0032_0000;
        arch::map_page(waker_task.as_id(), 0x1200_0000, frame);
        arch::map_page(sleeper_task.as_id(), 0x3400_0000, frame);

        // The waker posts first, from its own mapping of the page...
        testsupport::install_running(&waker_task, 0);
        assert_eq!(sys_futex_wakeup(0x1200_0000 + 4), EOK);

        // ...so the sleeper's wait is satisfied immediately.
        testsupport::install_running(&sleeper_task, 0);
        assert_eq!(sys_futex_sleep(0x3400_0000 + 4), EOK);

        cpu_cleanup();
        task_cleanup(&waker_task);
        task_cleanup(&sleeper_task);
    }

    #[test]
    fn sleep_on_an_unmapped_word_is_an_error() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let task = testsupport::make_task();
        testsupport::install_running(&task, 0);
        assert_eq!(
            sys_futex_sleep(0x6600_0000),
            ErrorCode::ENOENT.as_word()
        );
        cpu_cleanup();
    }

    fn cpu_cleanup() {
        crate::cpu::cpu(0).take_current();
    }

    #[test]
    fn page_size_is_a_power_of_two() {
        assert!(PAGE_SIZE.is_power_of_two());
    }
}
