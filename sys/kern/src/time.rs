// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time: the tick counter, sleep timeouts, and the clock tick.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::cpu;
use crate::sched;
use crate::thread::Thread;
use crate::waitq;

/// Length of one kernel tick, in microseconds.
pub const TICK_US: u64 = 10_000;

/// In-kernel timestamp representation, measured in ticks since boot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

static KERNEL_TICKS: AtomicU64 = AtomicU64::new(0);

pub fn now() -> Timestamp {
    Timestamp(KERNEL_TICKS.load(Ordering::Relaxed))
}

/// Converts a microsecond interval to ticks, rounding up so that a nonzero
/// timeout always waits at least one full tick.
pub fn us2ticks(us: u64) -> u64 {
    us.div_ceil(TICK_US)
}

/// A pending sleep timeout on some CPU's timer.
pub struct TimeoutEntry {
    pub deadline: Timestamp,
    pub thread: Weak<Thread>,
}

/// Arms a sleep timeout for `thread` on the current CPU.
pub fn sleep_timeout_register(thread: &Arc<Thread>, usec: u64) {
    let deadline = Timestamp(u64::from(now()) + us2ticks(usec));
    thread.inner.lock().timeout_pending = true;
    cpu::current().timeouts.lock().push(TimeoutEntry {
        deadline,
        thread: Arc::downgrade(thread),
    });
}

/// Disarms any pending sleep timeout for `thread`. The wake path runs this,
/// possibly on a different CPU than the one that armed the timeout.
pub fn sleep_timeout_cancel(thread: &Arc<Thread>) {
    let target = Arc::as_ptr(thread);
    for c in cpu::all() {
        c.timeouts
            .lock()
            .retain(|e| e.thread.as_ptr() != target);
    }
    thread.inner.lock().timeout_pending = false;
}

/// The per-CPU timer interrupt handler.
///
/// Advances kernel time (boot CPU only), fires expired sleep timeouts, ages
/// the run queues' relink counter, and charges the current thread's tick
/// budget, forcing a reschedule when the quantum runs out.
pub fn clock_tick() {
    let c = cpu::current();
    if c.id == 0 {
        KERNEL_TICKS.fetch_add(1, Ordering::Relaxed);
    }

    let expired: Vec<Weak<Thread>> = {
        let mut timeouts = c.timeouts.lock();
        let t = now();
        let mut fired = Vec::new();
        timeouts.retain(|e| {
            if e.deadline <= t {
                fired.push(e.thread.clone());
                false
            } else {
                true
            }
        });
        fired
    };
    for w in expired {
        if let Some(t) = w.upgrade() {
            t.inner.lock().timeout_pending = false;
            waitq::timeout_fire(&t);
        }
    }

    c.sched.lock().needs_relink += 1;

    if let Some(t) = c.current_thread() {
        let quantum_expired = {
            let mut ti = t.inner.lock();
            if ti.ticks > 0 {
                ti.ticks -= 1;
            }
            ti.ticks == 0
        };
        if quantum_expired {
            sched::schedule();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport;
    use crate::thread::ThreadState;
    use crate::waitq::{SleepResult, WaitQueue};

    #[test]
    fn us2ticks_rounds_up() {
        assert_eq!(us2ticks(0), 0);
        assert_eq!(us2ticks(1), 1);
        assert_eq!(us2ticks(TICK_US), 1);
        assert_eq!(us2ticks(TICK_US + 1), 2);
    }

    #[test]
    fn expired_timeouts_wake_the_sleeper_with_timeout() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        crate::arch::set_current_cpu(0);
        let task = testsupport::make_task();
        let wq = WaitQueue::new();
        let t = testsupport::make_sleeper(&task, &wq);
        sleep_timeout_register(&t, TICK_US);

        clock_tick();
        {
            let ti = t.inner.lock();
            assert_eq!(ti.state, ThreadState::Ready);
            assert_eq!(ti.sleep_result, SleepResult::Timeout);
            assert!(!ti.timeout_pending);
        }
        // The banked entry is gone; another tick must not re-fire.
        assert!(cpu::cpu(0).timeouts.lock().is_empty());
        testsupport::drain_cpu(0);
    }

    #[test]
    fn waking_early_disarms_the_timeout() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        crate::arch::set_current_cpu(0);
        let task = testsupport::make_task();
        let wq = WaitQueue::new();
        let t = testsupport::make_sleeper(&task, &wq);
        sleep_timeout_register(&t, TICK_US);

        wq.wake_one();
        assert_eq!(t.inner.lock().sleep_result, SleepResult::Ok);
        assert!(cpu::cpu(0).timeouts.lock().is_empty());
        testsupport::drain_cpu(0);
    }

    #[test]
    fn ticks_age_the_relink_counter() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        crate::arch::set_current_cpu(0);
        let before = cpu::cpu(0).sched.lock().needs_relink;
        clock_tick();
        assert_eq!(cpu::cpu(0).sched.lock().needs_relink, before + 1);
    }
}
