// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel threads.
//!
//! A thread is in exactly one place at any instant: linked in a single run
//! queue, linked in a single wait queue, installed as some CPU's current
//! thread, or on its way to destruction. The `state` field names which, and
//! every transition happens under `inner`'s lock.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

use abi::Sysarg;
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec;

use crate::arch;
use crate::cpu;
use crate::sched;
use crate::spinlock::{IrqSpinlock, RANK_THREAD};
use crate::task::Task;
use crate::waitq::{SleepFlags, SleepResult, WaitQueue};

/// Size of a thread's kernel stack.
pub const KSTACK_SIZE: usize = 16 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct ThreadFlags: u8 {
        /// Pinned to one CPU; exempt from load balancing.
        const WIRED = 1 << 0;
        /// Recently migrated; cleared when the thief CPU first runs it, so a
        /// thread is never stolen twice without running in between.
        const STOLEN = 1 << 1;
        /// This thread's FPU context is live in its CPU's hardware.
        const FPU_OWNED = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadState {
    /// Created but never made ready.
    Entering,
    /// Linked in some run queue.
    Ready,
    /// Installed as some CPU's current thread.
    Running,
    /// Linked in the wait queue named by `sleep_queue`.
    Sleeping,
    /// Will be reclaimed at the next scheduler entry on its CPU.
    Exiting,
    /// Detached from its task, awaiting final reclamation.
    Lingering,
}

/// A one-shot callback the scheduler invokes the next time the thread goes to
/// sleep, after the wait-queue hand-off has committed.
#[derive(Copy, Clone)]
pub struct DeferredCall {
    pub func: fn(Sysarg),
    pub arg: Sysarg,
}

pub struct ThreadInner {
    pub state: ThreadState,
    pub flags: ThreadFlags,
    /// Scheduling priority, i.e. the run-queue index this thread re-enters.
    /// -1 marks a freshly woken (or freshly created) thread that should be
    /// boosted into queue 0.
    pub priority: i8,
    /// Remaining tick budget before forced reschedule.
    pub ticks: u64,
    /// CPU of last execution, and the CPU `ready` will enqueue on.
    pub cpu: Option<usize>,
    /// While `Sleeping`, the wait queue this thread is linked in.
    pub sleep_queue: Option<*const WaitQueue>,
    pub sleep_result: SleepResult,
    pub sleep_interruptible: bool,
    pub timeout_pending: bool,
    pub call_me: Option<DeferredCall>,
}

// Safety: `sleep_queue` is only dereferenced while the thread is linked in
// that queue, and a wait queue strictly outlives its sleepers (the sleeper's
// own stack frame keeps stack-allocated queues alive, owners keep embedded
// ones alive).
unsafe impl Send for ThreadInner {}

pub struct FpuState {
    pub ctx: arch::FpuContext,
    pub exists: bool,
}

pub struct Thread {
    id: u64,
    pub task: Weak<Task>,
    /// Kernel stack, exclusively owned; reclaimed by the scheduler when the
    /// thread exits.
    kstack: IrqSpinlock<Option<Box<[u8]>>>,
    /// Base of the user stack in the owning task's address space, if any.
    ustack: IrqSpinlock<Option<Sysarg>>,
    /// Saved CPU context. Only the scheduler touches this, and only for a
    /// thread that is not running.
    saved_context: UnsafeCell<arch::Context>,
    pub fpu: IrqSpinlock<FpuState>,
    pub inner: IrqSpinlock<ThreadInner>,
}

// Safety: `saved_context` is accessed exclusively by the scheduler while the
// thread is switched out; everything else is behind locks.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Creates a thread in `Entering` state and links it into `task`.
    ///
    /// `wired_cpu` pins the thread to one CPU and sets `WIRED`.
    pub fn new(task: &Arc<Task>, wired_cpu: Option<usize>) -> Arc<Thread> {
        let mut flags = ThreadFlags::empty();
        if wired_cpu.is_some() {
            flags |= ThreadFlags::WIRED;
        }
        let thread = Arc::new(Thread {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            task: Arc::downgrade(task),
            kstack: IrqSpinlock::new(Some(
                vec![0u8; KSTACK_SIZE].into_boxed_slice(),
            )),
            ustack: IrqSpinlock::new(None),
            saved_context: UnsafeCell::new(arch::Context::default()),
            fpu: IrqSpinlock::new(FpuState {
                ctx: Default::default(),
                exists: false,
            }),
            inner: IrqSpinlock::with_rank(
                RANK_THREAD,
                ThreadInner {
                    state: ThreadState::Entering,
                    flags,
                    priority: -1,
                    ticks: 0,
                    cpu: wired_cpu,
                    sleep_queue: None,
                    sleep_result: SleepResult::Ok,
                    sleep_interruptible: false,
                    timeout_pending: false,
                    call_me: None,
                },
            ),
        });
        task.inner.lock().threads.push(Arc::clone(&thread));
        thread
    }

    /// Creates a thread set up to enter `entry` on its kernel stack, and
    /// makes it ready.
    pub fn spawn(
        task: &Arc<Task>,
        entry: fn() -> !,
        wired_cpu: Option<usize>,
    ) -> Arc<Thread> {
        let thread = Self::new(task, wired_cpu);
        let stack_top = {
            let kstack = thread.kstack.lock();
            let stack = kstack.as_ref().unwrap();
            stack.as_ptr() as Sysarg + stack.len() as Sysarg
        };
        // Safety: the thread has never run; nothing else can reach its
        // context yet.
        unsafe {
            arch::context_init(
                &mut *thread.saved_context.get(),
                entry as Sysarg,
                stack_top,
            );
        }
        thread.ready();
        thread
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_ustack(&self, base: Sysarg) {
        *self.ustack.lock() = Some(base);
    }

    /// Saved-context accessor for the scheduler.
    ///
    /// # Safety
    ///
    /// Caller must be the scheduler, operating on a thread that is not
    /// currently executing.
    pub unsafe fn saved_context(&self) -> *mut arch::Context {
        self.saved_context.get()
    }

    /// Reclaims the kernel stack and user stack. Scheduler use only.
    pub(crate) fn free_stacks(&self) {
        drop(self.kstack.lock().take());
        if let Some(base) = self.ustack.lock().take() {
            arch::frame_free(base);
        }
    }

    /// Registers a one-shot out-of-context callback, invoked by the
    /// scheduler the next time this thread goes to sleep.
    pub fn call_me(&self, func: fn(Sysarg), arg: Sysarg) {
        let mut inner = self.inner.lock();
        uassert!(inner.call_me.is_none());
        inner.call_me = Some(DeferredCall { func, arg });
    }

    /// Makes the thread ready: links it into a run queue on its CPU (its
    /// wired CPU, its last CPU, or the current one, in that order of
    /// preference). A negative priority -- fresh or just woken -- is boosted
    /// into queue 0.
    pub fn ready(self: &Arc<Self>) {
        let (queue_index, target) = {
            let mut inner = self.inner.lock();
            let queue_index = if inner.priority < 0 {
                0
            } else {
                inner.priority as usize
            };
            let target = if inner.flags.contains(ThreadFlags::WIRED) {
                uassert!(inner.cpu.is_some());
                inner.cpu.unwrap()
            } else {
                inner.cpu.unwrap_or_else(arch::current_cpu_id)
            };
            inner.cpu = Some(target);
            inner.state = ThreadState::Ready;
            (queue_index, target)
        };
        cpu::cpu(target).enqueue(queue_index, Arc::clone(self));
    }

    /// Detaches this thread from its task's thread list.
    pub(crate) fn detach_from_task(self: &Arc<Self>) {
        if let Some(task) = self.task.upgrade() {
            task.inner
                .lock()
                .threads
                .retain(|t| !Arc::ptr_eq(t, self));
        }
    }
}

/// The thread currently executing on this CPU, if the CPU has one.
pub fn current_thread() -> Option<Arc<Thread>> {
    cpu::get(arch::current_cpu_id())?.current_thread()
}

/// Puts the current thread to sleep for at least `usec` microseconds.
pub fn usleep(usec: u64) {
    let wq = WaitQueue::new();
    let r = wq.sleep_timeout(usec, SleepFlags::empty());
    uassert_eq!(r, SleepResult::Timeout);
}

/// Terminates the current thread. Its stacks and structure are reclaimed by
/// the next scheduler entry on this CPU.
pub fn exit() -> ! {
    {
        let thread = current_thread()
            .unwrap_or_else(|| panic!("thread exit with no current thread"));
        thread.inner.lock().state = ThreadState::Exiting;
    }
    loop {
        sched::schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport;

    #[test]
    fn ready_boosts_fresh_threads_into_queue_zero() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let task = testsupport::make_task();
        let t = Thread::new(&task, None);
        t.ready();

        let c = cpu::cpu(0);
        assert_eq!(c.nrdy(), 1);
        let found = {
            let q = c.rq[0].queue.lock();
            q.iter().any(|x| Arc::ptr_eq(x, &t))
        };
        assert!(found);
        assert_eq!(t.inner.lock().state, ThreadState::Ready);
        testsupport::drain_cpu(0);
    }

    #[test]
    fn wired_threads_ready_onto_their_own_cpu() {
        let _g = testsupport::serialize();
        testsupport::boot(2);
        let task = testsupport::make_task();
        let t = Thread::new(&task, Some(1));
        t.ready();

        assert_eq!(cpu::cpu(1).nrdy(), 1);
        assert_eq!(cpu::cpu(0).nrdy(), 0);
        testsupport::drain_cpu(1);
    }

    #[test]
    fn deferred_calls_register_once() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let task = testsupport::make_task();
        let t = Thread::new(&task, None);

        fn probe(_arg: abi::Sysarg) {}
        t.call_me(probe, 7);
        {
            let ti = t.inner.lock();
            let dc = ti.call_me.as_ref().unwrap();
            assert_eq!(dc.arg, 7);
        }
    }

    #[test]
    fn threads_register_and_detach_from_their_task() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let task = testsupport::make_task();
        let t = Thread::new(&task, None);
        assert_eq!(task.inner.lock().threads.len(), 1);
        t.detach_from_task();
        assert_eq!(task.inner.lock().threads.len(), 0);
    }
}
