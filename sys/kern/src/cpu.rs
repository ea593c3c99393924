// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-CPU state: run queues, ready counters, FPU ownership, timeouts.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::arch;
use crate::spinlock::{IrqSpinlock, RANK_CPU, RANK_RUNQUEUE};
use crate::task::Task;
use crate::thread::Thread;
use crate::time::TimeoutEntry;

/// Number of run-queue priority levels per CPU. Queue 0 is the most urgent.
pub const RQ_COUNT: usize = 16;

/// Ticks of aging before `relink_rq` promotes starved queues.
pub const NEEDS_RELINK_MAX: u64 = 16;

/// One priority level's FIFO of ready threads.
pub struct RunQueue {
    pub queue: IrqSpinlock<VecDeque<Arc<Thread>>>,
}

impl RunQueue {
    fn new() -> Self {
        RunQueue {
            queue: IrqSpinlock::with_rank(RANK_RUNQUEUE, VecDeque::new()),
        }
    }
}

/// CPU-local scheduler bookkeeping.
pub struct CpuSched {
    /// Aging counter; bumped by the clock tick, consumed by `relink_rq`.
    pub needs_relink: u64,
    /// The thread whose FPU context is live in this CPU's hardware.
    pub fpu_owner: Option<Weak<Thread>>,
}

pub struct Cpu {
    pub id: usize,
    active: AtomicBool,
    /// Ready threads on this CPU, mirrored in the global counter.
    nrdy: AtomicUsize,
    pub rq: [RunQueue; RQ_COUNT],
    pub sched: IrqSpinlock<CpuSched>,
    current: IrqSpinlock<Option<Arc<Thread>>>,
    /// Task whose address space this CPU last installed.
    current_task: IrqSpinlock<Option<Arc<Task>>>,
    pub timeouts: IrqSpinlock<Vec<TimeoutEntry>>,
    /// Stack the scheduler's bottom half runs on, separate from any
    /// thread's stack so the outgoing thread's stack can be reclaimed.
    pub sched_stack: IrqSpinlock<Option<alloc::boxed::Box<[u8]>>>,
}

impl Cpu {
    fn new(id: usize) -> Arc<Cpu> {
        Arc::new(Cpu {
            id,
            active: AtomicBool::new(true),
            nrdy: AtomicUsize::new(0),
            rq: core::array::from_fn(|_| RunQueue::new()),
            sched: IrqSpinlock::with_rank(
                RANK_CPU,
                CpuSched {
                    needs_relink: 0,
                    fpu_owner: None,
                },
            ),
            current: IrqSpinlock::with_rank(RANK_CPU, None),
            current_task: IrqSpinlock::with_rank(RANK_CPU, None),
            timeouts: IrqSpinlock::new(Vec::new()),
            sched_stack: IrqSpinlock::new(Some(
                alloc::vec![0u8; crate::thread::KSTACK_SIZE]
                    .into_boxed_slice(),
            )),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn set_active(&self, on: bool) {
        self.active.store(on, Ordering::Relaxed);
    }

    pub fn nrdy(&self) -> usize {
        self.nrdy.load(Ordering::Relaxed)
    }

    /// Links a ready thread into run queue `priority`, maintaining both
    /// ready counters.
    pub fn enqueue(&self, priority: usize, thread: Arc<Thread>) {
        self.rq[priority].queue.lock().push_back(thread);
        self.nrdy.fetch_add(1, Ordering::Relaxed);
        NRDY.fetch_add(1, Ordering::Relaxed);
    }

    /// Accounts for a thread leaving this CPU's run queues. The caller has
    /// already unlinked it.
    pub fn note_dequeue(&self) {
        self.nrdy.fetch_sub(1, Ordering::Relaxed);
        NRDY.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.current.lock().clone()
    }

    pub fn set_current(&self, thread: Arc<Thread>) {
        *self.current.lock() = Some(thread);
    }

    pub fn take_current(&self) -> Option<Arc<Thread>> {
        self.current.lock().take()
    }

    pub fn current_task(&self) -> Option<Arc<Task>> {
        self.current_task.lock().clone()
    }

    pub fn set_current_task(&self, task: Arc<Task>) {
        *self.current_task.lock() = Some(task);
    }
}

/// All Ready threads system-wide.
static NRDY: AtomicUsize = AtomicUsize::new(0);

static CPUS: IrqSpinlock<Vec<Arc<Cpu>>> =
    IrqSpinlock::with_rank(RANK_CPU, Vec::new());

/// Brings the CPU registry up to `count` CPUs. Growing an already
/// initialized registry is permitted (late application processors).
pub fn init(count: usize) {
    let mut cpus = CPUS.lock();
    while cpus.len() < count {
        let id = cpus.len();
        cpus.push(Cpu::new(id));
    }
}

pub fn get(id: usize) -> Option<Arc<Cpu>> {
    CPUS.lock().get(id).cloned()
}

pub fn cpu(id: usize) -> Arc<Cpu> {
    get(id).unwrap_or_else(|| panic!("no such cpu: {id}"))
}

/// The CPU this code is executing on.
pub fn current() -> Arc<Cpu> {
    cpu(arch::current_cpu_id())
}

pub fn all() -> Vec<Arc<Cpu>> {
    CPUS.lock().clone()
}

pub fn count() -> usize {
    CPUS.lock().len()
}

pub fn active_count() -> usize {
    CPUS.lock().iter().filter(|c| c.is_active()).count()
}

pub fn global_nrdy() -> usize {
    NRDY.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport;

    #[test]
    fn ready_counters_stay_in_sync() {
        let _g = testsupport::serialize();
        testsupport::boot(2);
        let task = testsupport::make_task();

        let before = global_nrdy();
        let t0 = Thread::new(&task, None);
        let t1 = Thread::new(&task, Some(1));
        {
            let mut i = t0.inner.lock();
            i.cpu = Some(0);
        }
        t0.ready();
        t1.ready();
        assert_eq!(global_nrdy(), before + 2);
        assert_eq!(
            cpu(0).nrdy() + cpu(1).nrdy(),
            global_nrdy(),
        );

        testsupport::drain_cpu(0);
        testsupport::drain_cpu(1);
        assert_eq!(global_nrdy(), before);
    }
}
