// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel bring-up and shutdown state.

use core::sync::atomic::{AtomicBool, Ordering};

use abi::TaskCaps;
use alloc::sync::Arc;

use crate::cpu;
use crate::kcpulb;
use crate::sched;
use crate::task::{AddressSpace, Task};
use crate::thread::Thread;

static HALTING: AtomicBool = AtomicBool::new(false);

/// True once shutdown has been requested; the scheduler parks CPUs instead
/// of dispatching.
pub fn halting() -> bool {
    HALTING.load(Ordering::Relaxed)
}

pub fn halt_system() {
    HALTING.store(true, Ordering::Relaxed);
}

/// Initializes kernel structures for `cpu_count` processors.
pub fn init(cpu_count: usize) {
    cpu::init(cpu_count);
}

fn kcpulb_entry() -> ! {
    kcpulb::kcpulb()
}

/// The main kernel entry point.
///
/// The embedder's bootstrap does hardware setup, then calls this once. The
/// kernel task owns the balancer threads and any further kernel services;
/// `first` is the initial userspace task, whose first thread must already
/// be ready.
///
/// # Safety
///
/// Must be called exactly once per boot, on the bootstrap CPU.
pub unsafe fn start_kernel(cpu_count: usize, first: &Arc<Task>) -> ! {
    init(cpu_count);

    let kernel_task =
        Task::new(AddressSpace::new(0), TaskCaps::all());
    for id in 0..cpu_count {
        // One load balancer per CPU, pinned there for life.
        Thread::spawn(&kernel_task, kcpulb_entry, Some(id));
    }

    uassert!(!first.inner.lock().threads.is_empty());

    // Dispatch the first thread; this never returns.
    loop {
        sched::schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport;

    #[test]
    fn init_is_idempotent_and_grow_only() {
        let _g = testsupport::serialize();
        init(1);
        init(2);
        init(1);
        assert!(cpu::count() >= 2);
    }
}
