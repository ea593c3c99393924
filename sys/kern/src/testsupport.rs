// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared fixtures for the kernel test suite.
//!
//! Scheduler, IPC, and futex state is process-global, so tests touching it
//! take the suite lock via `serialize` and clean up the CPUs they used.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use alloc::sync::Arc;

use crate::cpu;
use crate::task::{AddressSpace, Task};
use crate::thread::{Thread, ThreadState};
use crate::waitq::{SleepResult, WaitQueue};

static SUITE: Mutex<()> = Mutex::new(());

/// Serializes tests that share kernel-global state.
pub fn serialize() -> MutexGuard<'static, ()> {
    SUITE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ensures at least `n` CPUs exist and the test runs as CPU 0.
pub fn boot(n: usize) {
    cpu::init(n);
    crate::arch::set_current_cpu(0);
}

static NEXT_AS: AtomicU64 = AtomicU64::new(100);

/// A task with its own fresh address space and no capabilities.
pub fn make_task() -> Arc<Task> {
    let as_id = NEXT_AS.fetch_add(1, Ordering::Relaxed);
    Task::new(AddressSpace::new(as_id), abi::TaskCaps::all())
}

/// Creates a thread already linked into `wq` the way `sleep_timeout` would
/// leave it, without needing to actually suspend anything.
pub fn make_sleeper(task: &Arc<Task>, wq: &WaitQueue) -> Arc<Thread> {
    link_sleeper(task, wq, false)
}

pub fn make_interruptible_sleeper(
    task: &Arc<Task>,
    wq: &WaitQueue,
) -> Arc<Thread> {
    link_sleeper(task, wq, true)
}

fn link_sleeper(
    task: &Arc<Task>,
    wq: &WaitQueue,
    interruptible: bool,
) -> Arc<Thread> {
    let t = Thread::new(task, None);
    {
        let mut ti = t.inner.lock();
        ti.state = ThreadState::Sleeping;
        ti.sleep_queue = Some(wq as *const WaitQueue);
        ti.sleep_result = SleepResult::Ok;
        ti.sleep_interruptible = interruptible;
    }
    wq.inner.lock().sleepers.push_back(Arc::clone(&t));
    t
}

/// A thread made Ready on `cpu_id` at run-queue level `priority`.
pub fn ready_at(task: &Arc<Task>, cpu_id: usize, priority: i8) -> Arc<Thread> {
    let t = Thread::new(task, None);
    {
        let mut ti = t.inner.lock();
        ti.cpu = Some(cpu_id);
        ti.priority = priority;
    }
    t.ready();
    t
}

/// Like `ready_at`, but wired to the CPU.
pub fn ready_wired(
    task: &Arc<Task>,
    cpu_id: usize,
    priority: i8,
) -> Arc<Thread> {
    let t = Thread::new(task, Some(cpu_id));
    t.inner.lock().priority = priority;
    t.ready();
    t
}

/// Installs a fresh thread of `task` as the Running thread on `cpu_id` and
/// points the hosted CPU there, so `current_thread`/`current_task` resolve.
pub fn install_running(task: &Arc<Task>, cpu_id: usize) -> Arc<Thread> {
    let t = Thread::new(task, None);
    {
        let mut ti = t.inner.lock();
        ti.state = ThreadState::Running;
        ti.cpu = Some(cpu_id);
    }
    crate::arch::set_current_cpu(cpu_id);
    cpu::cpu(cpu_id).set_current(Arc::clone(&t));
    t
}

/// Clears the Running slot installed by `install_running`.
pub fn clear_current(cpu_id: usize) {
    cpu::cpu(cpu_id).take_current();
}

/// Empties every run queue of `cpu_id`, rebalancing the ready counters, so
/// the next test starts from an idle machine.
pub fn drain_cpu(cpu_id: usize) {
    let c = cpu::cpu(cpu_id);
    for rq in &c.rq {
        loop {
            let popped = rq.queue.lock().pop_front();
            if popped.is_none() {
                break;
            }
            c.note_dequeue();
        }
    }
}
