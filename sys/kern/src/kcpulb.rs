// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The per-CPU load balancer.
//!
//! One of these runs as a wired kernel thread on every CPU, waking once a
//! second to pull work toward itself whenever it is poorer than the system
//! average. It steals the cheapest threads first -- lowest priority, from
//! the tail of the donor's queue -- and never touches wired threads,
//! recently stolen threads, or threads whose FPU context is live in the
//! donor's hardware.

use alloc::sync::Arc;

use crate::cpu::{self, Cpu, RQ_COUNT};
use crate::sched;
use crate::thread::{self, ThreadFlags};

/// How many threads `cpu` is short of the system average. The +1 keeps a
/// lone ready thread from bouncing between idle CPUs.
fn deficit(c: &Arc<Cpu>) -> isize {
    let average = cpu::global_nrdy() / cpu::active_count().max(1) + 1;
    average as isize - c.nrdy() as isize
}

/// One balancing pass: steals up to the current deficit's worth of threads
/// from richer CPUs onto `c`. Returns the number migrated.
pub fn rebalance(c: &Arc<Cpu>) -> usize {
    let average = cpu::global_nrdy() / cpu::active_count().max(1) + 1;
    let mut wanted = average as isize - c.nrdy() as isize;
    if wanted <= 0 {
        return 0;
    }

    let mut stolen = 0;
    let mut k = 0;
    let cpus = cpu::all();

    // Least urgent queues across all CPUs first: those threads are the
    // cheapest to move and wait the longest anyway.
    for j in (0..RQ_COUNT).rev() {
        for i in 0..cpus.len() {
            let donor = &cpus[(i + k) % cpus.len()];
            if Arc::ptr_eq(donor, c) || !donor.is_active() {
                continue;
            }
            if donor.nrdy() <= average {
                continue;
            }

            let candidate = {
                let mut q = donor.rq[j].queue.lock();
                // Search from the tail; the head is closest to running.
                let mut found = None;
                for idx in (0..q.len()).rev() {
                    let ti = q[idx].inner.lock();
                    let fixed = ti.flags.intersects(
                        ThreadFlags::WIRED | ThreadFlags::STOLEN,
                    ) || ti.flags.contains(ThreadFlags::FPU_OWNED);
                    drop(ti);
                    if !fixed {
                        found = Some(idx);
                        break;
                    }
                }
                found.map(|idx| {
                    let t = q.remove(idx).unwrap();
                    donor.note_dequeue();
                    t
                })
            };

            if let Some(t) = candidate {
                {
                    let mut ti = t.inner.lock();
                    ti.flags.insert(ThreadFlags::STOLEN);
                    ti.cpu = Some(c.id);
                }
                t.ready();
                stolen += 1;
                wanted -= 1;
                if wanted == 0 {
                    return stolen;
                }
                // Focus on another donor next time.
                k += 1;
            }
        }
    }
    stolen
}

/// Body of the load-balancer thread, wired to its CPU.
pub fn kcpulb() -> ! {
    let c = cpu::current();
    loop {
        // Work in one-second intervals.
        thread::usleep(1_000_000);
        loop {
            if deficit(&c) <= 0 {
                break;
            }
            let stolen = rebalance(&c);
            if c.nrdy() > 0 {
                // Be light-weight and let migrated threads run.
                sched::schedule();
            }
            if stolen == 0 {
                // Nothing left to steal anywhere; give up this turn.
                break;
            }
        }
    }
}
