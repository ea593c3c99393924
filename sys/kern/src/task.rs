// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tasks: address-space-owning containers for threads and phones.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use abi::{ErrorCode, Sysarg, TaskCaps, IPC_MAX_PHONES};
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::cap::HandleTable;
use crate::futex::{self, Futex};
use crate::ipc::{self, Answerbox, CallSlot, Phone};
use crate::irq::IrqObject;
use crate::mutex::Mutex;
use crate::spinlock::{IrqSpinlock, RANK_TASK};
use crate::thread::{self, Thread};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle on an address space. The actual page tables live behind the arch
/// layer; the kernel core only needs identity.
pub struct AddressSpace {
    id: u64,
}

impl AddressSpace {
    pub fn new(id: u64) -> Arc<AddressSpace> {
        Arc::new(AddressSpace { id })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

pub struct TaskInner {
    pub threads: Vec<Arc<Thread>>,
}

pub struct Task {
    id: u64,
    as_: Arc<AddressSpace>,
    caps: IrqSpinlock<TaskCaps>,
    pub inner: IrqSpinlock<TaskInner>,
    pub answerbox: Arc<Answerbox>,
    /// Fixed phone table; slots cycle Free -> Connecting -> Connected ->
    /// Hungup -> Free.
    pub phones: Vec<Arc<Phone>>,
    /// Outstanding asynchronous requests, bounded by
    /// `IPC_MAX_ASYNC_CALLS`.
    pub active_calls: AtomicUsize,
    /// Call handles: reservations for this task's async requests and
    /// ownership of requests it has received but not yet answered.
    pub calls: IrqSpinlock<HandleTable<CallSlot>>,
    /// IRQ capability handles.
    pub irq_caps: IrqSpinlock<HandleTable<Arc<IrqObject>>>,
    /// Cache of userspace futex words this task has touched, keyed by
    /// virtual address. Each entry holds one reference on the kernel futex.
    pub futexes: Mutex<BTreeMap<Sysarg, Arc<Futex>>>,
}

impl Task {
    pub fn new(as_: Arc<AddressSpace>, caps: TaskCaps) -> Arc<Task> {
        Arc::new_cyclic(|weak: &Weak<Task>| Task {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            as_,
            caps: IrqSpinlock::new(caps),
            inner: IrqSpinlock::with_rank(
                RANK_TASK,
                TaskInner {
                    threads: Vec::new(),
                },
            ),
            answerbox: Answerbox::new(Some(weak.clone())),
            phones: (0..IPC_MAX_PHONES)
                .map(|i| Arc::new(Phone::new(weak.clone(), i)))
                .collect(),
            active_calls: AtomicUsize::new(0),
            calls: IrqSpinlock::new(HandleTable::new()),
            irq_caps: IrqSpinlock::new(HandleTable::new()),
            futexes: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.as_
    }

    pub fn as_id(&self) -> u64 {
        self.as_.id()
    }

    pub fn caps(&self) -> TaskCaps {
        *self.caps.lock()
    }

    pub fn grant_caps(&self, add: TaskCaps) {
        self.caps.lock().insert(add);
    }

    /// Looks up a phone by the id userspace supplied.
    pub fn get_phone(&self, id: Sysarg) -> Result<&Arc<Phone>, ErrorCode> {
        self.phones.get(id).ok_or(ErrorCode::ENOENT)
    }

    /// Claims the lowest free phone slot, leaving it in `Connecting` state.
    pub fn phone_alloc(&self) -> Option<usize> {
        for p in &self.phones {
            let mut inner = p.inner.lock();
            if inner.state == ipc::PhoneState::Free {
                inner.state = ipc::PhoneState::Connecting;
                return Some(p.id);
            }
        }
        None
    }

    /// Returns a slot claimed by `phone_alloc` (or left over from a hangup)
    /// to the free pool.
    pub fn phone_dealloc(&self, id: usize) {
        let p = &self.phones[id];
        let mut inner = p.inner.lock();
        uassert!(matches!(
            inner.state,
            ipc::PhoneState::Connecting | ipc::PhoneState::Hungup
        ));
        inner.state = ipc::PhoneState::Free;
        inner.callee = None;
    }
}

/// Tears down a task's IPC and futex state on its way out: hangs up every
/// connected phone and drops the futex cache's references.
pub fn destroy(task: &Arc<Task>) {
    for p in &task.phones {
        if p.state() == ipc::PhoneState::Connected {
            let _ = ipc::phone_hangup(p);
        }
    }
    futex::task_cleanup(task);
}

/// The task owning the thread currently executing on this CPU.
pub fn current_task() -> Option<Arc<Task>> {
    thread::current_thread()?.task.upgrade()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport;

    #[test]
    fn phone_alloc_returns_the_lowest_free_slot() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let task = testsupport::make_task();

        assert_eq!(task.phone_alloc(), Some(0));
        assert_eq!(task.phone_alloc(), Some(1));
        task.phone_dealloc(0);
        assert_eq!(task.phone_alloc(), Some(0));
    }

    #[test]
    fn phone_table_is_bounded() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let task = testsupport::make_task();
        for _ in 0..IPC_MAX_PHONES {
            assert!(task.phone_alloc().is_some());
        }
        assert_eq!(task.phone_alloc(), None);
    }

    #[test]
    fn bad_phone_ids_are_rejected() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let task = testsupport::make_task();
        assert!(task.get_phone(IPC_MAX_PHONES).is_err());
        assert!(task.get_phone(0).is_ok());
    }

    #[test]
    fn destroy_hangs_up_every_connection() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let client = testsupport::make_task();
        let server = testsupport::make_task();

        for _ in 0..2 {
            let id = client.phone_alloc().unwrap();
            ipc::phone_connect(&client.phones[id], &server.answerbox);
        }
        assert_eq!(server.answerbox.connected_phone_count(), 2);

        destroy(&client);
        assert_eq!(server.answerbox.connected_phone_count(), 0);
        for id in 0..2 {
            assert_eq!(client.phones[id].state(), ipc::PhoneState::Hungup);
        }
        // The callee was told, once per connection.
        for _ in 0..2 {
            let msg = ipc::wait_for_call(
                &server.answerbox,
                0,
                crate::waitq::SleepFlags::NON_BLOCKING,
            )
            .unwrap();
            assert_eq!(msg.data.imethod, abi::IPC_M_PHONE_HUNGUP);
        }
    }
}
