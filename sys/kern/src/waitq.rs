// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wait queues: a FIFO of sleeping threads plus a missed-wakeup count.
//!
//! The missed-wakeup count is what makes wake and sleep commute: a wake
//! delivered to an empty queue is banked and satisfies the next sleeper
//! immediately. Every blocking primitive in the kernel -- answerbox waits,
//! futexes, mutexes, timed thread sleeps -- is built on this type.
//!
//! # The sleep hand-off
//!
//! Going to sleep must be atomic against wake: the sleeper links itself and
//! changes state under the queue lock, then enters the scheduler *still
//! holding that lock*. The scheduler releases it only once the context
//! switch has committed, so no wake can observe a half-asleep thread. This
//! is the kernel's one unlock-after-switch idiom; see
//! `IrqSpinlockGuard::defuse`.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch;
use crate::sched;
use crate::spinlock::{IrqSpinlock, RANK_WAITQ};
use crate::thread::{self, Thread, ThreadState};
use crate::time;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct SleepFlags: u32 {
        /// The sleep may be cancelled externally, returning `Interrupted`.
        const INTERRUPTIBLE = 1 << 0;
        /// Fail with `WouldBlock` instead of sleeping.
        const NON_BLOCKING = 1 << 1;
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum SleepResult {
    /// A wakeup arrived (or had already been banked).
    #[default]
    Ok,
    /// `NON_BLOCKING` was set and no wakeup was banked.
    WouldBlock,
    /// The sleep was cancelled from outside.
    Interrupted,
    /// The timeout elapsed.
    Timeout,
}

impl SleepResult {
    pub fn error(self) -> Option<abi::ErrorCode> {
        match self {
            SleepResult::Ok => None,
            SleepResult::WouldBlock => Some(abi::ErrorCode::EAGAIN),
            SleepResult::Interrupted => Some(abi::ErrorCode::INTERRUPTED),
            SleepResult::Timeout => Some(abi::ErrorCode::TIMEOUT),
        }
    }
}

pub struct WaitQueueInner {
    pub(crate) missed_wakeups: usize,
    pub(crate) sleepers: VecDeque<Arc<Thread>>,
}

pub struct WaitQueue {
    pub(crate) inner: IrqSpinlock<WaitQueueInner>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        WaitQueue {
            inner: IrqSpinlock::with_rank(
                RANK_WAITQ,
                WaitQueueInner {
                    missed_wakeups: 0,
                    sleepers: VecDeque::new(),
                },
            ),
        }
    }

    /// Sleeps until woken, cancelled, or timed out.
    ///
    /// `usec == 0` means no timeout. With `NON_BLOCKING`, returns
    /// `WouldBlock` rather than suspending when no wakeup is banked.
    pub fn sleep_timeout(&self, usec: u64, flags: SleepFlags) -> SleepResult {
        let mut inner = self.inner.lock();
        if inner.missed_wakeups > 0 {
            inner.missed_wakeups -= 1;
            return SleepResult::Ok;
        }
        if flags.contains(SleepFlags::NON_BLOCKING) {
            return SleepResult::WouldBlock;
        }

        let thread = thread::current_thread()
            .unwrap_or_else(|| panic!("sleep with no current thread"));
        {
            let mut ti = thread.inner.lock();
            uassert_eq!(ti.state, ThreadState::Running);
            ti.state = ThreadState::Sleeping;
            ti.sleep_queue = Some(self as *const WaitQueue);
            ti.sleep_result = SleepResult::Ok;
            ti.sleep_interruptible = flags.contains(SleepFlags::INTERRUPTIBLE);
        }
        inner.sleepers.push_back(Arc::clone(&thread));
        if usec > 0 {
            time::sleep_timeout_register(&thread, usec);
        }

        // Enter the scheduler with the queue lock held; it is released in
        // scheduler_separated_stack once the switch has committed.
        let ipl = inner.defuse();
        sched::schedule();

        // A wakeup, cancellation, or timeout has run and readied us again.
        arch::interrupts_restore(ipl);
        let sleep_result = thread.inner.lock().sleep_result;
        sleep_result
    }

    /// Wakes the first sleeper in FIFO order, or banks the wakeup if the
    /// queue is empty.
    pub fn wake_one(&self) {
        self.wake(false);
    }

    /// Wakes every sleeper; banks one wakeup if there are none.
    pub fn wake_all(&self) {
        self.wake(true);
    }

    fn wake(&self, all: bool) {
        let woken: Vec<Arc<Thread>> = {
            let mut inner = self.inner.lock();
            if inner.sleepers.is_empty() {
                inner.missed_wakeups += 1;
                Vec::new()
            } else if all {
                inner.sleepers.drain(..).collect()
            } else {
                let t = inner.sleepers.pop_front().unwrap();
                alloc::vec![t]
            }
        };
        for t in &woken {
            finish_wake(t, SleepResult::Ok);
        }
    }

    /// Releases the queue lock left held across a context switch by
    /// `sleep_timeout`.
    ///
    /// # Safety
    ///
    /// Caller must be `scheduler_separated_stack` handling the thread that
    /// took the lock.
    pub(crate) unsafe fn release_after_switch(&self) {
        self.inner.raw_unlock();
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes a wakeup after the thread has been unlinked from its queue.
fn finish_wake(thread: &Arc<Thread>, result: SleepResult) {
    let had_timeout = {
        let mut ti = thread.inner.lock();
        ti.sleep_queue = None;
        ti.sleep_result = result;
        ti.sleep_interruptible = false;
        ti.timeout_pending
    };
    if had_timeout {
        time::sleep_timeout_cancel(thread);
    }
    thread.ready();
}

/// Cancels an interruptible sleep, making it return `Interrupted`. A thread
/// that is not in an interruptible sleep is left alone.
pub fn interrupt_sleep(thread: &Arc<Thread>) {
    unsleep(thread, SleepResult::Interrupted, true);
}

/// Fires a sleep timeout, making the sleep return `Timeout`. Called from the
/// clock tick.
pub(crate) fn timeout_fire(thread: &Arc<Thread>) {
    unsleep(thread, SleepResult::Timeout, false);
}

fn unsleep(thread: &Arc<Thread>, result: SleepResult, only_interruptible: bool) {
    loop {
        let wq_ptr = {
            let ti = thread.inner.lock();
            if only_interruptible && !ti.sleep_interruptible {
                return;
            }
            match ti.sleep_queue {
                Some(p) => p,
                None => return,
            }
        };
        // Safety: a recorded sleep queue means the thread is linked in it,
        // and a wait queue outlives its sleepers.
        let wq = unsafe { &*wq_ptr };
        let mut inner = wq.inner.lock();
        {
            let ti = thread.inner.lock();
            if ti.sleep_queue != Some(wq_ptr) {
                // Raced with a wakeup between reading the pointer and taking
                // the queue lock; reevaluate.
                continue;
            }
        }
        let pos = inner
            .sleepers
            .iter()
            .position(|t| Arc::ptr_eq(t, thread));
        uassert!(pos.is_some());
        let t = inner.sleepers.remove(pos.unwrap()).unwrap();
        drop(inner);
        finish_wake(&t, result);
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport;

    #[test]
    fn wake_on_empty_queue_satisfies_the_next_sleeper() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let wq = WaitQueue::new();
        wq.wake_one();
        assert_eq!(
            wq.sleep_timeout(0, SleepFlags::empty()),
            SleepResult::Ok,
        );
    }

    #[test]
    fn nonblocking_sleep_fails_without_banked_wakeup() {
        let wq = WaitQueue::new();
        assert_eq!(
            wq.sleep_timeout(0, SleepFlags::NON_BLOCKING),
            SleepResult::WouldBlock,
        );
    }

    #[test]
    fn each_banked_wakeup_is_consumed_exactly_once() {
        let wq = WaitQueue::new();
        wq.wake_one();
        wq.wake_one();
        assert_eq!(
            wq.sleep_timeout(0, SleepFlags::NON_BLOCKING),
            SleepResult::Ok,
        );
        assert_eq!(
            wq.sleep_timeout(0, SleepFlags::NON_BLOCKING),
            SleepResult::Ok,
        );
        assert_eq!(
            wq.sleep_timeout(0, SleepFlags::NON_BLOCKING),
            SleepResult::WouldBlock,
        );
    }

    #[test]
    fn wake_all_banks_a_single_wakeup_when_empty() {
        let wq = WaitQueue::new();
        wq.wake_all();
        wq.wake_all();
        assert_eq!(
            wq.sleep_timeout(0, SleepFlags::NON_BLOCKING),
            SleepResult::Ok,
        );
        assert_eq!(
            wq.sleep_timeout(0, SleepFlags::NON_BLOCKING),
            SleepResult::Ok,
        );
        assert_eq!(
            wq.sleep_timeout(0, SleepFlags::NON_BLOCKING),
            SleepResult::WouldBlock,
        );
    }

    #[test]
    fn wake_one_readies_sleepers_in_fifo_order() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let task = testsupport::make_task();
        let wq = WaitQueue::new();

        // Link two pre-built sleepers the way sleep_timeout would.
        let a = testsupport::make_sleeper(&task, &wq);
        let b = testsupport::make_sleeper(&task, &wq);

        wq.wake_one();
        assert_eq!(a.inner.lock().state, ThreadState::Ready);
        assert_eq!(b.inner.lock().state, ThreadState::Sleeping);
        wq.wake_one();
        assert_eq!(b.inner.lock().state, ThreadState::Ready);
        testsupport::drain_cpu(0);
    }

    #[test]
    fn interrupt_only_cancels_interruptible_sleeps() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let task = testsupport::make_task();
        let wq = WaitQueue::new();

        let hard = testsupport::make_sleeper(&task, &wq);
        interrupt_sleep(&hard);
        assert_eq!(hard.inner.lock().state, ThreadState::Sleeping);

        let soft = testsupport::make_interruptible_sleeper(&task, &wq);
        interrupt_sleep(&soft);
        {
            let ti = soft.inner.lock();
            assert_eq!(ti.state, ThreadState::Ready);
            assert_eq!(ti.sleep_result, SleepResult::Interrupted);
        }
        wq.wake_one();
        assert_eq!(hard.inner.lock().state, ThreadState::Ready);
        testsupport::drain_cpu(0);
    }
}
