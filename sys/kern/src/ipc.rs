// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IPC endpoints and message carriers.
//!
//! A `Call` is a message in flight. Ownership of the `Box` travels with list
//! membership: a call sits in exactly one answerbox queue, or in the
//! recipient task's call table while that task is working on its answer, or
//! on a sender's stack during a synchronous call. There is no other place a
//! call can be.
//!
//! A `Phone` is a task's directional handle onto some answerbox. Requests
//! flow phone -> callee answerbox; the answer comes back to the caller's
//! answerbox, or to a private reply box for synchronous calls so unrelated
//! traffic cannot interleave.

use abi::{CallHandle, ErrorCode, IpcData, Sysarg, IPC_M_PHONE_HUNGUP};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::spinlock::{IrqSpinlock, RANK_ANSWERBOX, RANK_PHONE};
use crate::task::Task;
use crate::waitq::{SleepFlags, SleepResult, WaitQueue};

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct CallFlags: u32 {
        /// Carries an answer back to the caller.
        const ANSWERED = 1 << 0;
        /// Kernel-originated IRQ notification; never answerable.
        const NOTIF = 1 << 1;
        /// Has been forwarded at least once.
        const FORWARDED = 1 << 2;
        /// Connection request with a caller-side phone riding along.
        const CONN_ME_TO = 1 << 3;
        /// The answer is consumed by the kernel instead of userspace.
        const DISCARD_ANSWER = 1 << 4;
    }
}

/// A message carrier.
pub struct Call {
    pub data: IpcData,
    pub flags: CallFlags,
    /// Originating task; `None` for kernel-originated notifications.
    pub sender: Option<Weak<Task>>,
    /// Private reply box overriding the sender's answerbox, used by
    /// synchronous calls.
    pub callerbox: Option<Arc<Answerbox>>,
    /// The phone the call was last sent through, for hangup processing on
    /// the answering side.
    pub phone: Option<Arc<Phone>>,
    /// Caller-side phone riding along on a connection request.
    pub conn_phone: Option<Arc<Phone>>,
    /// Kernel scratch for the preprocess hooks (new phone slot, IRQ
    /// sequence number).
    pub private: Sysarg,
    /// Caller-side handle identifying the answer of an asynchronous call.
    pub handle: Option<CallHandle>,
}

impl Call {
    pub fn new() -> Box<Call> {
        Box::new(Call {
            data: IpcData::default(),
            flags: CallFlags::empty(),
            sender: None,
            callerbox: None,
            phone: None,
            conn_phone: None,
            private: 0,
            handle: None,
        })
    }
}

/// A slot in a task's call table.
///
/// `Outstanding` reserves a handle for an asynchronous request this task
/// sent; the eventual answer is matched back to it. `Received` owns a
/// request this task picked up with `wait_for_call` and has yet to answer.
pub enum CallSlot {
    Outstanding,
    Received(Box<Call>),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PhoneState {
    Free,
    Connecting,
    Connected,
    Hungup,
}

pub struct PhoneInner {
    pub state: PhoneState,
    pub callee: Option<Arc<Answerbox>>,
}

pub struct Phone {
    pub id: usize,
    pub owner: Weak<Task>,
    pub inner: IrqSpinlock<PhoneInner>,
}

impl Phone {
    pub fn new(owner: Weak<Task>, id: usize) -> Phone {
        Phone {
            id,
            owner,
            inner: IrqSpinlock::with_rank(
                RANK_PHONE,
                PhoneInner {
                    state: PhoneState::Free,
                    callee: None,
                },
            ),
        }
    }

    pub fn state(&self) -> PhoneState {
        self.inner.lock().state
    }
}

/// A task-owned endpoint on which incoming calls and notifications queue.
pub struct Answerbox {
    pub owner: Option<Weak<Task>>,
    /// Wakes `wait_for_call` when any queue becomes nonempty.
    pub wq: WaitQueue,
    calls: IrqSpinlock<VecDeque<Box<Call>>>,
    answers: IrqSpinlock<VecDeque<Box<Call>>>,
    irq_notifs: IrqSpinlock<VecDeque<Box<Call>>>,
    connected_phones: IrqSpinlock<Vec<Weak<Phone>>>,
}

impl Answerbox {
    pub fn new(owner: Option<Weak<Task>>) -> Arc<Answerbox> {
        Arc::new(Answerbox {
            owner,
            wq: WaitQueue::new(),
            calls: IrqSpinlock::with_rank(RANK_ANSWERBOX, VecDeque::new()),
            answers: IrqSpinlock::with_rank(RANK_ANSWERBOX, VecDeque::new()),
            irq_notifs: IrqSpinlock::with_rank(
                RANK_ANSWERBOX,
                VecDeque::new(),
            ),
            connected_phones: IrqSpinlock::with_rank(
                RANK_ANSWERBOX,
                Vec::new(),
            ),
        })
    }

    pub fn connected_phone_count(&self) -> usize {
        self.connected_phones.lock().len()
    }
}

/// Connects `phone` to `callee`, linking it on the callee's phone list.
pub fn phone_connect(phone: &Arc<Phone>, callee: &Arc<Answerbox>) {
    callee
        .connected_phones
        .lock()
        .push(Arc::downgrade(phone));
    let mut inner = phone.inner.lock();
    inner.state = PhoneState::Connected;
    inner.callee = Some(Arc::clone(callee));
}

/// Severs `phone` from whatever answerbox it references. Idempotent.
pub fn phone_detach(phone: &Arc<Phone>) {
    let callee = {
        let inner = phone.inner.lock();
        inner.callee.clone()
    };
    if let Some(b) = callee {
        b.connected_phones
            .lock()
            .retain(|w| w.as_ptr() != Arc::as_ptr(phone));
    }
    let mut inner = phone.inner.lock();
    inner.callee = None;
    if inner.state == PhoneState::Connected {
        inner.state = PhoneState::Hungup;
    }
}

/// Hangs up the caller side of `phone`: notifies the callee with a
/// `PHONE_HUNGUP` message and detaches. Subsequent sends fail with `ENOENT`.
pub fn phone_hangup(phone: &Arc<Phone>) -> Result<(), ErrorCode> {
    let callee = {
        let inner = phone.inner.lock();
        match inner.state {
            PhoneState::Connected => inner.callee.clone(),
            PhoneState::Hungup => None,
            PhoneState::Free | PhoneState::Connecting => {
                return Err(ErrorCode::EINVAL)
            }
        }
    };
    if let Some(b) = callee {
        let mut call = Call::new();
        call.data.imethod = IPC_M_PHONE_HUNGUP;
        call.flags |= CallFlags::DISCARD_ANSWER;
        call.sender = Some(phone.owner.clone());
        call.phone = Some(Arc::clone(phone));
        stamp_sender(&mut call);
        send_to(&b, call);
    }
    phone_detach(phone);
    Ok(())
}

fn stamp_sender(call: &mut Call) {
    // Argument slot 0 is reserved for the kernel: on requests it carries the
    // sending task's id.
    if let Some(t) = call.sender.as_ref().and_then(|w| w.upgrade()) {
        call.data.args[0] = t.id() as Sysarg;
    }
}

fn send_to(b: &Arc<Answerbox>, call: Box<Call>) {
    b.calls.lock().push_back(call);
    b.wq.wake_one();
}

/// Sends `call` through `phone`. On failure the call is handed back so the
/// caller can surface the error.
pub fn call(
    phone: &Arc<Phone>,
    mut call: Box<Call>,
) -> Result<(), (ErrorCode, Box<Call>)> {
    let callee = {
        let inner = phone.inner.lock();
        match inner.state {
            PhoneState::Connected => inner.callee.clone().unwrap(),
            _ => return Err((ErrorCode::ENOENT, call)),
        }
    };
    call.phone = Some(Arc::clone(phone));
    stamp_sender(&mut call);
    send_to(&callee, call);
    Ok(())
}

/// Completes `call` and routes it back to where its answer belongs: the
/// private reply box if one rides along, the sending task's answerbox
/// otherwise. A kernel-originated call with neither is consumed here.
pub fn answer(mut call: Box<Call>) {
    call.flags |= CallFlags::ANSWERED;
    let target = call.callerbox.clone().or_else(|| {
        call.sender
            .as_ref()
            .and_then(|w| w.upgrade())
            .map(|t| Arc::clone(&t.answerbox))
    });
    if let Some(b) = target {
        b.answers.lock().push_back(call);
        b.wq.wake_one();
    }
}

/// Queues an IRQ notification on `b`.
pub fn send_notification(b: &Arc<Answerbox>, call: Box<Call>) {
    b.irq_notifs.lock().push_back(call);
    b.wq.wake_one();
}

/// Re-sends an already received call through a new phone. The sysipc layer
/// has already rewritten the arguments and set `FORWARDED`.
pub fn forward(
    call: Box<Call>,
    phone: &Arc<Phone>,
) -> Result<(), (ErrorCode, Box<Call>)> {
    self::call(phone, call)
}

/// Takes the next pending item off `b`, notifications first, then answers,
/// then requests. Blocks per `flags`/`usec` when everything is empty;
/// returns `None` on timeout, interruption, or `NON_BLOCKING` emptiness.
pub fn wait_for_call(
    b: &Arc<Answerbox>,
    usec: u64,
    flags: SleepFlags,
) -> Option<Box<Call>> {
    loop {
        if let Some(c) = b.irq_notifs.lock().pop_front() {
            return Some(c);
        }
        if let Some(c) = b.answers.lock().pop_front() {
            return Some(c);
        }
        if let Some(c) = b.calls.lock().pop_front() {
            return Some(c);
        }
        match b.wq.sleep_timeout(usec, flags) {
            SleepResult::Ok => continue,
            _ => return None,
        }
    }
}

/// Looks up a received (answerable) call by handle, transferring ownership
/// to the caller. `None` covers stale, foreign, and outstanding handles.
pub fn take_received(task: &Task, handle: CallHandle) -> Option<Box<Call>> {
    let handle = handle.without_tags();
    let mut table = task.calls.lock();
    let answerable =
        matches!(table.get(handle), Some(CallSlot::Received(_)));
    if !answerable {
        return None;
    }
    match table.take(handle) {
        Some(CallSlot::Received(c)) => Some(c),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport;

    fn connect_pair() -> (Arc<Task>, Arc<Task>, Arc<Phone>) {
        let client = testsupport::make_task();
        let server = testsupport::make_task();
        let id = client.phone_alloc().unwrap();
        let phone = Arc::clone(&client.phones[id]);
        phone_connect(&phone, &server.answerbox);
        (client, server, phone)
    }

    #[test]
    fn messages_on_one_phone_arrive_in_send_order() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let (_c, server, phone) = connect_pair();

        for m in [10, 11, 12] {
            let mut msg = Call::new();
            msg.data.imethod = m;
            call(&phone, msg).map_err(|(e, _)| e).unwrap();
        }
        let order: alloc::vec::Vec<Sysarg> = (0..3)
            .map(|_| {
                wait_for_call(
                    &server.answerbox,
                    0,
                    SleepFlags::NON_BLOCKING,
                )
                .unwrap()
                .data
                .imethod
            })
            .collect();
        assert_eq!(order, [10, 11, 12]);
    }

    #[test]
    fn each_call_is_delivered_exactly_once() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let (_c, server, phone) = connect_pair();

        call(&phone, Call::new()).map_err(|(e, _)| e).unwrap();
        assert!(wait_for_call(
            &server.answerbox,
            0,
            SleepFlags::NON_BLOCKING
        )
        .is_some());
        assert!(wait_for_call(
            &server.answerbox,
            0,
            SleepFlags::NON_BLOCKING
        )
        .is_none());
    }

    #[test]
    fn notifications_preempt_answers_preempt_requests() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let (client, server, phone) = connect_pair();
        let _ = server;

        let mut req = Call::new();
        req.data.imethod = 1;
        call(&phone, req).map_err(|(e, _)| e).unwrap();

        // An answer and a notification land on the *client's* box.
        let mut ans = Call::new();
        ans.data.imethod = 2;
        ans.sender = Some(Arc::downgrade(&client));
        answer(ans);

        let mut notif = Call::new();
        notif.data.imethod = 3;
        notif.flags |= CallFlags::NOTIF;
        send_notification(&client.answerbox, notif);

        let first =
            wait_for_call(&client.answerbox, 0, SleepFlags::NON_BLOCKING)
                .unwrap();
        assert!(first.flags.contains(CallFlags::NOTIF));
        let second =
            wait_for_call(&client.answerbox, 0, SleepFlags::NON_BLOCKING)
                .unwrap();
        assert!(second.flags.contains(CallFlags::ANSWERED));
    }

    #[test]
    fn hangup_detaches_and_notifies_the_callee() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let (_c, server, phone) = connect_pair();
        assert_eq!(server.answerbox.connected_phone_count(), 1);

        phone_hangup(&phone).unwrap();
        assert_eq!(phone.state(), PhoneState::Hungup);
        assert_eq!(server.answerbox.connected_phone_count(), 0);

        let msg =
            wait_for_call(&server.answerbox, 0, SleepFlags::NON_BLOCKING)
                .unwrap();
        assert_eq!(msg.data.imethod, IPC_M_PHONE_HUNGUP);
        assert!(msg.flags.contains(CallFlags::DISCARD_ANSWER));

        // The phone is dead for future sends.
        let r = call(&phone, Call::new());
        assert!(matches!(r, Err((ErrorCode::ENOENT, _))));
    }

    #[test]
    fn answers_route_to_the_private_box_when_present() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let (client, _server, _phone) = connect_pair();

        let sync_box = Answerbox::new(None);
        let mut c = Call::new();
        c.sender = Some(Arc::downgrade(&client));
        c.callerbox = Some(Arc::clone(&sync_box));
        answer(c);

        assert!(wait_for_call(&sync_box, 0, SleepFlags::NON_BLOCKING)
            .is_some());
        assert!(wait_for_call(
            &client.answerbox,
            0,
            SleepFlags::NON_BLOCKING
        )
        .is_none());
    }
}
