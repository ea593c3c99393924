// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler: multi-level per-CPU run queues with aging.
//!
//! Entry is split in two. `schedule` runs on the outgoing thread's stack and
//! saves its context; `scheduler_separated_stack` runs on the CPU's private
//! scheduler stack, which is what makes it safe to reclaim an exiting
//! thread's kernel stack before picking the next thread. The split is the
//! architectural contract: the hop between the halves is the only
//! arch-specific stack switch in the kernel.

use alloc::sync::Arc;

use crate::arch::{self, SaveResult};
use crate::cpu::{self, Cpu, NEEDS_RELINK_MAX, RQ_COUNT};
use crate::startup;
use crate::thread::{self, Thread, ThreadFlags, ThreadState};
use crate::time;

/// Tick budget granted to a thread dispatched from run queue `priority`.
/// Lower-priority threads run less often but get longer slices.
pub fn quantum_ticks(priority: usize) -> u64 {
    time::us2ticks(((priority + 1) * 10_000) as u64)
}

/// Picks the most urgent ready thread for `cpu`, sleeping the CPU while no
/// work exists anywhere on it.
///
/// The returned thread has been unlinked and charged a fresh quantum, and
/// its `STOLEN` mark is cleared, making it eligible for migration again.
/// Interrupts are disabled on return.
pub fn find_best_thread(c: &Arc<Cpu>) -> Arc<Thread> {
    loop {
        arch::interrupts_enable();
        if c.nrdy() == 0 {
            // Halt until an interrupt delivers work. The wakeup may race us
            // back to sleep once; the next interrupt gets us out.
            arch::cpu_sleep();
            continue;
        }
        let _ipl = arch::interrupts_disable();

        for i in 0..RQ_COUNT {
            let taken = {
                let mut q = c.rq[i].queue.lock();
                q.pop_front()
            };
            let Some(t) = taken else { continue };
            c.note_dequeue();

            let mut ti = t.inner.lock();
            ti.cpu = Some(c.id);
            ti.ticks = quantum_ticks(i);
            ti.priority = i as i8;
            ti.flags.remove(ThreadFlags::STOLEN);
            drop(ti);
            return t;
        }
    }
}

/// Prevents starvation: once the aging counter trips, each run queue from
/// `start` up is concatenated onto the next more urgent one, promoting
/// long-waiting threads a level.
pub fn relink_rq(c: &Arc<Cpu>, start: usize) {
    let mut cs = c.sched.lock();
    if cs.needs_relink <= NEEDS_RELINK_MAX {
        return;
    }
    for i in start..RQ_COUNT - 1 {
        let moved = {
            let mut upper = c.rq[i + 1].queue.lock();
            core::mem::take(&mut *upper)
        };
        if moved.is_empty() {
            continue;
        }
        c.rq[i].queue.lock().extend(moved);
    }
    cs.needs_relink = 0;
}

/// FPU handling on the way into a thread.
fn before_thread_runs(c: &Arc<Cpu>, t: &Arc<Thread>) {
    #[cfg(feature = "fpu-lazy")]
    {
        let owns = {
            let cs = c.sched.lock();
            matches!(&cs.fpu_owner,
                Some(w) if w.as_ptr() == Arc::as_ptr(t))
        };
        if owns {
            arch::fpu_enable();
        } else {
            // First touch will trap into fpu_lazy_request.
            arch::fpu_disable();
        }
    }
    #[cfg(not(feature = "fpu-lazy"))]
    {
        let _ = c;
        arch::fpu_enable();
        let mut f = t.fpu.lock();
        if f.exists {
            arch::fpu_context_restore(&f.ctx);
        } else {
            arch::fpu_init();
            f.exists = true;
        }
    }
}

/// Handles the trap taken when a thread first touches the FPU under lazy
/// switching: banks the previous owner's context and installs (or
/// initializes) the current thread's.
pub fn fpu_lazy_request() {
    arch::fpu_enable();
    let c = cpu::current();
    let t = thread::current_thread()
        .unwrap_or_else(|| panic!("fpu trap with no current thread"));

    let prev = c.sched.lock().fpu_owner.take();
    if let Some(prev) = prev.and_then(|w| w.upgrade()) {
        if !Arc::ptr_eq(&prev, &t) {
            let mut f = prev.fpu.lock();
            arch::fpu_context_save(&mut f.ctx);
            drop(f);
            // The old owner's context is banked; it may migrate again.
            prev.inner.lock().flags.remove(ThreadFlags::FPU_OWNED);
        }
    }

    {
        let mut f = t.fpu.lock();
        if f.exists {
            arch::fpu_context_restore(&f.ctx);
        } else {
            arch::fpu_init();
            f.exists = true;
        }
    }
    c.sched.lock().fpu_owner = Some(Arc::downgrade(&t));
    t.inner.lock().flags.insert(ThreadFlags::FPU_OWNED);
}

/// The scheduler entry point.
///
/// Saves the outgoing thread's context and hops to the CPU's scheduler
/// stack. When the outgoing thread is eventually dispatched again, control
/// returns out of this function on its stack, with its interrupt state
/// restored.
pub fn schedule() {
    let ipl = arch::interrupts_disable();

    if startup::halting() {
        arch::halt();
    }

    let c = cpu::current();
    if let Some(t) = c.current_thread() {
        #[cfg(not(feature = "fpu-lazy"))]
        {
            let mut f = t.fpu.lock();
            arch::fpu_context_save(&mut f.ctx);
            f.exists = true;
        }
        // Safety: `t` is this CPU's current thread and we are running on it.
        let resumed = unsafe {
            arch::context_save(&mut *t.saved_context()) == SaveResult::Resumed
        };
        if resumed {
            // This is where threads leave the scheduler, arbitrarily later.
            before_thread_runs(&c, &t);
            arch::interrupts_restore(ipl);
            return;
        }
    }

    // We may not keep the outgoing thread's stack: once it becomes Ready (or
    // Sleeping and woken), another CPU can dispatch it and use that stack
    // while we are still scheduling here.
    let stack_top = {
        let stack = c.sched_stack.lock();
        let s = stack.as_ref().unwrap();
        s.as_ptr() as abi::Sysarg + s.len() as abi::Sysarg
    };
    // Safety: the scheduler stack is reserved for exactly this hop.
    unsafe { arch::run_on_scheduler_stack(stack_top, scheduler_separated_stack) }
}

/// Bottom half of the scheduler, on the CPU's private stack.
fn scheduler_separated_stack() -> ! {
    let c = cpu::current();

    if let Some(t) = c.take_current() {
        let state = t.inner.lock().state;
        match state {
            ThreadState::Running => {
                // Preempted; back into its queue at its current priority.
                t.ready();
            }
            ThreadState::Exiting => {
                t.free_stacks();
                t.detach_from_task();
                let mut cs = c.sched.lock();
                if let Some(owner) = &cs.fpu_owner {
                    if owner.as_ptr() == Arc::as_ptr(&t) {
                        cs.fpu_owner = None;
                    }
                }
                // Dropping the last reference reclaims the structure.
            }
            ThreadState::Sleeping => {
                let (wq, deferred) = {
                    let mut ti = t.inner.lock();
                    // Prefer the thread once it wakes.
                    ti.priority = -1;
                    (ti.sleep_queue, ti.call_me.take())
                };
                uassert!(wq.is_some());
                // The switch away from the sleeper has committed; release
                // the wait-queue lock it left held.
                // Safety: the sleeper is linked in this queue, keeping it
                // alive, and the lock was left held for us by sleep_timeout.
                unsafe { (*wq.unwrap()).release_after_switch() };
                if let Some(dc) = deferred {
                    (dc.func)(dc.arg);
                }
            }
            other => {
                panic!("thread {} in unexpected state {:?}", t.id(), other);
            }
        }
    }

    let next = find_best_thread(&c);
    let priority = next.inner.lock().priority;
    relink_rq(&c, priority.max(0) as usize);

    // Switch address spaces only when both the task and its address space
    // actually differ; tasks may share one address space.
    if let Some(new_task) = next.task.upgrade() {
        let switch = match c.current_task() {
            Some(old) => old.as_id() != new_task.as_id(),
            None => true,
        };
        if switch {
            arch::as_install(new_task.as_id());
        }
        c.set_current_task(new_task);
    }

    next.inner.lock().state = ThreadState::Running;
    c.set_current(Arc::clone(&next));

    // Safety: `next` is not running anywhere; we are about to become it.
    unsafe { arch::context_restore(&*next.saved_context()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport;

    #[test]
    fn find_best_takes_the_most_urgent_queue_first() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        crate::arch::set_current_cpu(0);
        let task = testsupport::make_task();
        let c = cpu::cpu(0);

        let lo = testsupport::ready_at(&task, 0, 5);
        let hi = testsupport::ready_at(&task, 0, 1);

        let first = find_best_thread(&c);
        crate::arch::interrupts_enable();
        assert!(Arc::ptr_eq(&first, &hi));
        assert_eq!(first.inner.lock().priority, 1);
        assert_eq!(first.inner.lock().ticks, quantum_ticks(1));

        let second = find_best_thread(&c);
        crate::arch::interrupts_enable();
        assert!(Arc::ptr_eq(&second, &lo));
        assert_eq!(c.nrdy(), 0);
    }

    #[test]
    fn dispatch_clears_the_stolen_mark() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        crate::arch::set_current_cpu(0);
        let task = testsupport::make_task();
        let c = cpu::cpu(0);

        let t = testsupport::ready_at(&task, 0, 3);
        t.inner.lock().flags.insert(ThreadFlags::STOLEN);

        let picked = find_best_thread(&c);
        crate::arch::interrupts_enable();
        assert!(Arc::ptr_eq(&picked, &t));
        assert!(!picked.inner.lock().flags.contains(ThreadFlags::STOLEN));
    }

    #[test]
    fn relink_promotes_each_queue_one_level() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        crate::arch::set_current_cpu(0);
        let task = testsupport::make_task();
        let c = cpu::cpu(0);

        let t3 = testsupport::ready_at(&task, 0, 3);
        let t5 = testsupport::ready_at(&task, 0, 5);

        c.sched.lock().needs_relink = NEEDS_RELINK_MAX + 1;
        relink_rq(&c, 2);

        assert!(c.rq[3].queue.lock().is_empty());
        assert!({
            let q = c.rq[2].queue.lock();
            q.iter().any(|x| Arc::ptr_eq(x, &t3))
        });
        assert!({
            let q = c.rq[4].queue.lock();
            q.iter().any(|x| Arc::ptr_eq(x, &t5))
        });
        assert_eq!(c.sched.lock().needs_relink, 0);
        testsupport::drain_cpu(0);
    }

    #[test]
    fn relink_below_threshold_is_a_no_op() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        crate::arch::set_current_cpu(0);
        let task = testsupport::make_task();
        let c = cpu::cpu(0);

        let t = testsupport::ready_at(&task, 0, 7);
        c.sched.lock().needs_relink = 1;
        relink_rq(&c, 0);
        assert!({
            let q = c.rq[7].queue.lock();
            q.iter().any(|x| Arc::ptr_eq(x, &t))
        });
        testsupport::drain_cpu(0);
    }

    #[test]
    fn lazy_fpu_request_banks_the_previous_owner() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        crate::arch::set_current_cpu(0);
        let task = testsupport::make_task();
        let c = cpu::cpu(0);

        let a = testsupport::install_running(&task, 0);
        crate::arch::fpu_init();
        fpu_lazy_request();
        crate::arch::fpu_poke(0, 0xAA55);
        assert!(a.inner.lock().flags.contains(ThreadFlags::FPU_OWNED));

        // Another thread takes the CPU and touches the FPU.
        let b = testsupport::install_running(&task, 0);
        fpu_lazy_request();

        // A's live registers were banked into its context...
        assert_eq!(a.fpu.lock().ctx[0], 0xAA55);
        assert!(!a.inner.lock().flags.contains(ThreadFlags::FPU_OWNED));
        // ...and B now owns a freshly initialized FPU.
        assert!(b.inner.lock().flags.contains(ThreadFlags::FPU_OWNED));
        assert_eq!(crate::arch::fpu_peek(0), 0);
        assert!({
            let cs = c.sched.lock();
            cs.fpu_owner.as_ref().map(|w| w.as_ptr())
                == Some(Arc::as_ptr(&b))
        });
        c.take_current();
        c.sched.lock().fpu_owner = None;
    }
}
