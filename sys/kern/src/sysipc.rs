// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IPC syscalls and the kernel's interpretation of system methods.
//!
//! Methods at or below `IPC_M_LAST_SYSTEM` are contracts between the kernel
//! halves of both endpoints: `request_preprocess` runs on the sending side
//! before a call leaves, `process_request` when the receiver picks it up,
//! `answer_preprocess` when the receiver answers, and `process_answer` when
//! the answer reaches the original sender. Connection setup and teardown is
//! implemented entirely in these four hooks.

use abi::{
    CallHandle, ErrorCode, IpcData, IrqCmd, IrqCode, IrqPioRange, Sysarg,
    TaskCaps, EOK, IPC_CALLID_ANSWERED, IPC_CALLID_NOTIFICATION,
    IPC_CALLRET_FATAL, IPC_CALLRET_TEMPORARY, IPC_MAX_ASYNC_CALLS,
    IPC_M_AS_AREA_RECV, IPC_M_AS_AREA_SEND, IPC_M_CONNECT_ME_TO,
    IPC_M_CONNECT_TO_ME, IPC_M_LAST_SYSTEM, IPC_M_PHONE_HUNGUP,
    IRQ_MAX_PROG_SIZE, IRQ_MAX_RANGE_COUNT,
};
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use crate::arch;
use crate::ipc::{self, Answerbox, Call, CallFlags, CallSlot, Phone};
use crate::irq::{self, UnvalidatedCode};
use crate::task::{self, Task};
use crate::umem;
use crate::waitq::SleepFlags;

fn is_system_method(method: Sysarg) -> bool {
    method <= IPC_M_LAST_SYSTEM
}

/// Some system messages are meant only for the original receiver and may
/// not travel further.
fn is_forwardable(method: Sysarg) -> bool {
    !matches!(
        method,
        IPC_M_PHONE_HUNGUP | IPC_M_AS_AREA_SEND | IPC_M_AS_AREA_RECV
    )
}

/// Whether `answer_preprocess` needs the request as it looked before the
/// answering task overwrote the payload.
fn answer_need_old(call: &Call) -> bool {
    matches!(
        call.data.imethod,
        IPC_M_CONNECT_TO_ME
            | IPC_M_CONNECT_ME_TO
            | IPC_M_AS_AREA_SEND
            | IPC_M_AS_AREA_RECV
    )
}

/// Sender-side hook, run before a request leaves the task.
fn request_preprocess(
    task: &Arc<Task>,
    call: &mut Call,
) -> Result<(), ErrorCode> {
    match call.data.imethod {
        IPC_M_CONNECT_ME_TO => {
            // The new phone rides along with the request; the receiver's
            // answer decides whether it gets connected.
            let slot = task.phone_alloc().ok_or(ErrorCode::ELIMIT)?;
            call.conn_phone = Some(Arc::clone(&task.phones[slot]));
            call.flags |= CallFlags::CONN_ME_TO;
            call.private = slot;
            call.data.args[3] = slot;
        }
        IPC_M_AS_AREA_SEND => {
            let size = arch::as_area_size(task.as_id(), call.data.args[1])
                .ok_or(ErrorCode::EPERM)?;
            call.data.args[2] = size;
        }
        _ => {}
    }
    Ok(())
}

/// Receiver-side hook, run when an answer is submitted. `olddata` is the
/// request payload as delivered, for methods where the answer must be
/// interpreted against it.
fn answer_preprocess(
    task: &Arc<Task>,
    call: &mut Call,
    olddata: Option<&IpcData>,
) -> Result<(), ErrorCode> {
    if call.data.retval_code() == Some(ErrorCode::EHANGUP) {
        // Answering EHANGUP severs the connection the call arrived through,
        // whether it belongs to the original caller or to a forwarder.
        if let Some(p) = call.phone.clone() {
            ipc::phone_detach(&p);
        }
    }

    let Some(old) = olddata else { return Ok(()) };

    match old.imethod {
        IPC_M_CONNECT_TO_ME => {
            let slot = old.args[3];
            let sender = call.sender.as_ref().and_then(|w| w.upgrade());
            if call.data.retval != EOK {
                // The connection was not accepted.
                task.phone_dealloc(slot);
            } else if let Some(sender) = sender {
                ipc::phone_connect(&task.phones[slot], &sender.answerbox);
                call.data.args[3] = slot;
            } else {
                task.phone_dealloc(slot);
            }
        }
        IPC_M_CONNECT_ME_TO => {
            // On acceptance, wire the caller's new phone to us. Rejection
            // is cleaned up on the caller's side in process_answer.
            if call.data.retval == EOK {
                if let Some(p) = call.conn_phone.clone() {
                    ipc::phone_connect(&p, &task.answerbox);
                }
            }
        }
        IPC_M_AS_AREA_SEND => {
            if call.data.retval == EOK {
                let sender_as = call
                    .sender
                    .as_ref()
                    .and_then(|w| w.upgrade())
                    .map(|t| t.as_id())
                    .ok_or(ErrorCode::ENOENT)?;
                return arch::as_area_share(
                    sender_as,
                    old.args[1],
                    old.args[2],
                    task.as_id(),
                    call.data.args[1],
                    old.args[3],
                );
            }
        }
        IPC_M_AS_AREA_RECV => {
            if call.data.retval == EOK {
                let sender_as = call
                    .sender
                    .as_ref()
                    .and_then(|w| w.upgrade())
                    .map(|t| t.as_id())
                    .ok_or(ErrorCode::ENOENT)?;
                return arch::as_area_share(
                    task.as_id(),
                    call.data.args[1],
                    old.args[2],
                    sender_as,
                    old.args[1],
                    old.args[3],
                );
            }
        }
        _ => {}
    }
    Ok(())
}

/// Sender-side hook, run when an answer arrives back.
fn process_answer(task: &Arc<Task>, call: &mut Call) {
    if call.data.retval_code() == Some(ErrorCode::EHANGUP)
        && call.flags.contains(CallFlags::FORWARDED)
    {
        // The hangup happened beyond a forwarder, not on our own phone.
        call.data.set_retval_code(ErrorCode::EFORWARD);
    }

    if call.flags.contains(CallFlags::CONN_ME_TO) {
        let slot = call.private;
        if call.data.retval != EOK {
            task.phone_dealloc(slot);
        } else {
            // Tell userspace which phone slot now carries the connection.
            call.data.args[3] = slot;
        }
    }
}

/// Receiver-side hook, run before a request is surfaced to userspace.
/// Returns `None` when the kernel consumed the call.
fn process_request(task: &Arc<Task>, mut call: Box<Call>) -> Option<Box<Call>> {
    if call.data.imethod == IPC_M_CONNECT_TO_ME {
        match task.phone_alloc() {
            Some(slot) => call.data.args[3] = slot,
            None => {
                call.data.set_retval_code(ErrorCode::ELIMIT);
                ipc::answer(call);
                return None;
            }
        }
    }
    Some(call)
}

fn current() -> Result<Arc<Task>, ErrorCode> {
    task::current_task().ok_or(ErrorCode::ENOENT)
}

/// Sends `call` synchronously: the answer comes back through a private
/// reply box so nothing else can interleave, and the caller sleeps until it
/// arrives.
fn do_call_sync(
    task: &Arc<Task>,
    phone: &Arc<Phone>,
    mut call: Box<Call>,
) -> Box<Call> {
    let reply_box = Answerbox::new(None);
    call.sender = Some(Arc::downgrade(task));
    call.callerbox = Some(Arc::clone(&reply_box));
    match ipc::call(phone, call) {
        Ok(()) => loop {
            if let Some(mut answered) =
                ipc::wait_for_call(&reply_box, 0, SleepFlags::empty())
            {
                process_answer(task, &mut answered);
                break answered;
            }
        },
        Err((e, mut unsent)) => {
            unsent.data.set_retval_code(e);
            unsent
        }
    }
}

fn call_sync_inner(
    phone_id: Sysarg,
    mut call: Box<Call>,
    reply_ptr: Sysarg,
) -> Result<Sysarg, ErrorCode> {
    let task = current()?;
    let phone = Arc::clone(task.get_phone(phone_id)?);

    let answered = match request_preprocess(&task, &mut call) {
        Ok(()) => do_call_sync(&task, &phone, call),
        Err(e) => {
            call.data.set_retval_code(e);
            call
        }
    };
    umem::copy_to_uspace(reply_ptr, &answered.data)?;
    Ok(EOK)
}

pub fn sys_ipc_call_sync_fast(
    phone_id: Sysarg,
    method: Sysarg,
    arg1: Sysarg,
    reply_ptr: Sysarg,
) -> Sysarg {
    let mut call = Call::new();
    call.data.imethod = method;
    call.data.args[1] = arg1;
    fold(call_sync_inner(phone_id, call, reply_ptr))
}

pub fn sys_ipc_call_sync(
    phone_id: Sysarg,
    request_ptr: Sysarg,
    reply_ptr: Sysarg,
) -> Sysarg {
    let data: IpcData = match umem::copy_from_uspace(request_ptr) {
        Ok(d) => d,
        Err(e) => return e.as_word(),
    };
    let mut call = Call::new();
    call.data = data;
    fold(call_sync_inner(phone_id, call, reply_ptr))
}

/// Charges one outstanding async call against the task's budget.
fn check_call_limit(task: &Task) -> Result<(), ErrorCode> {
    if task.active_calls.fetch_add(1, Ordering::Relaxed) + 1
        > IPC_MAX_ASYNC_CALLS
    {
        task.active_calls.fetch_sub(1, Ordering::Relaxed);
        return Err(ErrorCode::ELIMIT);
    }
    Ok(())
}

fn do_call_async(task: &Arc<Task>, phone_id: Sysarg, mut call: Box<Call>) -> Sysarg {
    if check_call_limit(task).is_err() {
        return IPC_CALLRET_TEMPORARY;
    }
    let phone = match task.get_phone(phone_id) {
        Ok(p) => Arc::clone(p),
        Err(_) => {
            task.active_calls.fetch_sub(1, Ordering::Relaxed);
            return IPC_CALLRET_FATAL;
        }
    };
    let handle = match task.calls.lock().alloc(CallSlot::Outstanding) {
        Ok(h) => h,
        Err(_) => {
            task.active_calls.fetch_sub(1, Ordering::Relaxed);
            return IPC_CALLRET_TEMPORARY;
        }
    };
    call.sender = Some(Arc::downgrade(task));
    call.handle = Some(handle);

    match request_preprocess(task, &mut call) {
        Ok(()) => {
            if let Err((e, mut unsent)) = ipc::call(&phone, call) {
                // Report the failure as an ordinary answer so the caller's
                // bookkeeping unwinds through the normal path.
                unsent.data.set_retval_code(e);
                ipc::answer(unsent);
            }
        }
        Err(e) => {
            call.data.set_retval_code(e);
            ipc::answer(call);
        }
    }
    handle.0
}

pub fn sys_ipc_call_async_fast(
    phone_id: Sysarg,
    method: Sysarg,
    arg1: Sysarg,
    arg2: Sysarg,
) -> Sysarg {
    let task = match current() {
        Ok(t) => t,
        Err(_) => return IPC_CALLRET_FATAL,
    };
    let mut call = Call::new();
    call.data.imethod = method;
    call.data.args[1] = arg1;
    call.data.args[2] = arg2;
    do_call_async(&task, phone_id, call)
}

pub fn sys_ipc_call_async(phone_id: Sysarg, request_ptr: Sysarg) -> Sysarg {
    let task = match current() {
        Ok(t) => t,
        Err(_) => return IPC_CALLRET_FATAL,
    };
    let data: IpcData = match umem::copy_from_uspace(request_ptr) {
        Ok(d) => d,
        Err(e) => return e.as_word(),
    };
    let mut call = Call::new();
    call.data = data;
    do_call_async(&task, phone_id, call)
}

fn forward_inner(
    callid: Sysarg,
    phone_id: Sysarg,
    method: Sysarg,
    arg1: Sysarg,
) -> Result<Sysarg, ErrorCode> {
    let task = current()?;
    let handle = CallHandle(callid);
    if handle.tags() != 0 {
        return Err(ErrorCode::ENOENT);
    }
    let mut call =
        ipc::take_received(&task, handle).ok_or(ErrorCode::ENOENT)?;
    call.flags |= CallFlags::FORWARDED;

    let phone = match task.get_phone(phone_id) {
        Ok(p) => Arc::clone(p),
        Err(_) => {
            call.data.set_retval_code(ErrorCode::EFORWARD);
            ipc::answer(call);
            return Err(ErrorCode::ENOENT);
        }
    };

    if !is_forwardable(call.data.imethod) {
        call.data.set_retval_code(ErrorCode::EFORWARD);
        ipc::answer(call);
        return Err(ErrorCode::EPERM);
    }

    // Userspace may not rewrite the method of a system message; its
    // `method`/`arg1` land in arg1/arg2 instead. A forwarded connection
    // request also gives up the phone slot this task had staged for it.
    if is_system_method(call.data.imethod) {
        if call.data.imethod == IPC_M_CONNECT_TO_ME {
            task.phone_dealloc(call.data.args[3]);
        }
        call.data.args[1] = method;
        call.data.args[2] = arg1;
    } else {
        call.data.imethod = method;
        call.data.args[1] = arg1;
    }

    match ipc::forward(call, &phone) {
        Ok(()) => Ok(EOK),
        Err((_, mut unsent)) => {
            unsent.data.set_retval_code(ErrorCode::EFORWARD);
            ipc::answer(unsent);
            Err(ErrorCode::ENOENT)
        }
    }
}

pub fn sys_ipc_forward_fast(
    callid: Sysarg,
    phone_id: Sysarg,
    method: Sysarg,
    arg1: Sysarg,
) -> Sysarg {
    fold(forward_inner(callid, phone_id, method, arg1))
}

/// How an answer's payload is filled in before preprocessing.
enum AnswerData {
    Fast(Sysarg, Sysarg, Sysarg),
    Full(IpcData),
}

fn do_answer(callid: Sysarg, data: AnswerData) -> Sysarg {
    // Notification callids are not answerable; pretend success so drivers
    // can answer everything they receive indiscriminately.
    if callid & IPC_CALLID_NOTIFICATION != 0 {
        return EOK;
    }
    let task = match current() {
        Ok(t) => t,
        Err(e) => return e.as_word(),
    };
    let handle = CallHandle(callid);
    if handle.tags() != 0 {
        return ErrorCode::ENOENT.as_word();
    }
    let Some(mut call) = ipc::take_received(&task, handle) else {
        return ErrorCode::ENOENT.as_word();
    };

    let saved = if answer_need_old(&call) {
        Some(call.data)
    } else {
        None
    };
    match data {
        AnswerData::Fast(retval, arg1, arg2) => {
            call.data.set_retval(retval);
            call.data.args[1] = arg1;
            call.data.args[2] = arg2;
        }
        AnswerData::Full(d) => {
            call.data = d;
        }
    }

    let rc = answer_preprocess(&task, &mut call, saved.as_ref());
    ipc::answer(call);
    match rc {
        Ok(()) => EOK,
        Err(e) => e.as_word(),
    }
}

pub fn sys_ipc_answer_fast(
    callid: Sysarg,
    retval: Sysarg,
    arg1: Sysarg,
    arg2: Sysarg,
) -> Sysarg {
    do_answer(callid, AnswerData::Fast(retval, arg1, arg2))
}

pub fn sys_ipc_answer(callid: Sysarg, reply_ptr: Sysarg) -> Sysarg {
    // Copy before committing: a bad buffer must leave the call answerable.
    let data: IpcData = match umem::copy_from_uspace(reply_ptr) {
        Ok(d) => d,
        Err(e) => return e.as_word(),
    };
    do_answer(callid, AnswerData::Full(data))
}

pub fn sys_ipc_hangup(phone_id: Sysarg) -> Sysarg {
    let task = match current() {
        Ok(t) => t,
        Err(e) => return e.as_word(),
    };
    let phone = match task.get_phone(phone_id) {
        Ok(p) => Arc::clone(p),
        Err(e) => return e.as_word(),
    };
    match ipc::phone_hangup(&phone) {
        Ok(()) => {
            task.phone_dealloc(phone_id);
            EOK
        }
        Err(e) => e.as_word(),
    }
}

pub fn sys_ipc_wait_for_call(
    out_ptr: Sysarg,
    usec: Sysarg,
    nonblocking: Sysarg,
) -> Sysarg {
    let task = match current() {
        Ok(t) => t,
        Err(_) => return 0,
    };
    let mut flags = SleepFlags::INTERRUPTIBLE;
    if nonblocking != 0 {
        flags |= SleepFlags::NON_BLOCKING;
    }

    loop {
        let Some(mut call) =
            ipc::wait_for_call(&task.answerbox, usec as u64, flags)
        else {
            return 0;
        };

        if call.flags.contains(CallFlags::NOTIF) {
            let label = call.private;
            if umem::copy_to_uspace(out_ptr, &call.data).is_err() {
                return 0;
            }
            return (label << CallHandle::TAG_BITS) | IPC_CALLID_NOTIFICATION;
        }

        if call.flags.contains(CallFlags::ANSWERED) {
            process_answer(&task, &mut call);
            let handle = call.handle;
            if let Some(h) = handle {
                // Retire the reservation made at send time.
                task.calls.lock().take(h);
                task.active_calls.fetch_sub(1, Ordering::Relaxed);
            }
            if call.flags.contains(CallFlags::DISCARD_ANSWER) {
                continue;
            }
            uassert!(handle.is_some());
            if umem::copy_to_uspace(out_ptr, &call.data).is_err() {
                return 0;
            }
            return handle.unwrap().with_tags(IPC_CALLID_ANSWERED).0;
        }

        let Some(call) = process_request(&task, call) else {
            continue;
        };
        let snapshot = call.data;
        let handle = match task.calls.lock().alloc(CallSlot::Received(call)) {
            Ok(h) => h,
            Err(_) => {
                // No room to track another pending answer; drop it the way
                // an unreachable receiver would.
                continue;
            }
        };
        if umem::copy_to_uspace(out_ptr, &snapshot).is_err() {
            task.calls.lock().take(handle);
            return 0;
        }
        return handle.0;
    }
}

pub fn sys_ipc_register_irq(
    inr: Sysarg,
    imethod: Sysarg,
    ucode_ptr: Sysarg,
) -> Sysarg {
    fold(register_irq_inner(inr, imethod, ucode_ptr))
}

fn register_irq_inner(
    inr: Sysarg,
    imethod: Sysarg,
    ucode_ptr: Sysarg,
) -> Result<Sysarg, ErrorCode> {
    let task = current()?;
    if !task.caps().contains(TaskCaps::IRQ_REG) {
        return Err(ErrorCode::EPERM);
    }
    let code = if ucode_ptr == 0 {
        None
    } else {
        let header: IrqCode = umem::copy_from_uspace(ucode_ptr)?;
        if header.rangecount > IRQ_MAX_RANGE_COUNT
            || header.cmdcount > IRQ_MAX_PROG_SIZE
        {
            return Err(ErrorCode::ELIMIT);
        }
        let ranges: alloc::vec::Vec<IrqPioRange> =
            umem::copy_slice_from_uspace(header.ranges, header.rangecount)?;
        let cmds: alloc::vec::Vec<IrqCmd> =
            umem::copy_slice_from_uspace(header.cmds, header.cmdcount)?;
        Some(UnvalidatedCode { ranges, cmds })
    };
    let handle = irq::subscribe(&task, inr as u32, imethod, code)?;
    Ok(handle.0)
}

pub fn sys_ipc_unregister_irq(handle: Sysarg) -> Sysarg {
    let task = match current() {
        Ok(t) => t,
        Err(e) => return e.as_word(),
    };
    if !task.caps().contains(TaskCaps::IRQ_REG) {
        return ErrorCode::EPERM.as_word();
    }
    match irq::unsubscribe(&task, CallHandle(handle)) {
        Ok(()) => EOK,
        Err(e) => e.as_word(),
    }
}

fn fold(r: Result<Sysarg, ErrorCode>) -> Sysarg {
    match r {
        Ok(w) => w,
        Err(e) => e.as_word(),
    }
}
