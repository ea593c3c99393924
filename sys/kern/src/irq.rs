// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IRQ notifications and the top-half program interpreter.
//!
//! A driver task subscribes to an interrupt line with a small program that
//! runs at hard-IRQ time. The program reads and writes device registers
//! through six scratch slots and ends by accepting or declining the
//! interrupt; on accept, the scratch payload is shipped to the task's
//! answerbox as a notification message.
//!
//! Programs are validated and address-rewritten once, at subscription time.
//! The type system keeps the two stages honest: the interpreter only accepts
//! a `ValidatedProgram`, which can only be produced by `validate`.

use core::convert::TryFrom;

use abi::{
    CallHandle, ErrorCode, IrqCmd, IrqOp, IrqPioRange, Sysarg, IPC_CALL_LEN,
    IRQ_MAX_PROG_SIZE, IRQ_MAX_RANGE_COUNT,
};
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::arch;
use crate::ipc::{self, Answerbox, Call, CallFlags};
use crate::spinlock::IrqSpinlock;
use crate::task::Task;

/// Verdict of one owner's claim function.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IrqOwnership {
    Accept,
    Decline,
}

/// A top-half program as supplied by userspace, before any checking.
pub struct UnvalidatedCode {
    pub ranges: Vec<IrqPioRange>,
    pub cmds: Vec<IrqCmd>,
}

/// One instruction after validation: the opcode is decoded and `addr` is a
/// kernel virtual address inside one of the program's mapped ranges.
struct DecodedCmd {
    op: IrqOp,
    dstarg: usize,
    srcarg: usize,
    addr: Sysarg,
    value: Sysarg,
}

struct MappedRange {
    pbase: Sysarg,
    kbase: Sysarg,
    size: Sysarg,
}

/// A checked, mapped top-half program. Only `validate` constructs these, so
/// holding one is proof the interpreter's preconditions hold.
pub struct ValidatedProgram {
    ranges: Vec<MappedRange>,
    cmds: Vec<DecodedCmd>,
}

impl Drop for ValidatedProgram {
    fn drop(&mut self) {
        for r in &self.ranges {
            arch::km_unmap(r.kbase, r.size);
        }
    }
}

/// Statically checks the program text: every opcode known, every scratch
/// index in range, every predicate jump inside the program.
fn code_check(cmds: &[IrqCmd]) -> Result<Vec<(IrqOp, IrqCmd)>, ErrorCode> {
    let mut decoded = Vec::with_capacity(cmds.len());
    for (i, cmd) in cmds.iter().enumerate() {
        let op = IrqOp::try_from(cmd.opcode).map_err(|_| ErrorCode::EINVAL)?;
        if (cmd.srcarg as usize) >= IPC_CALL_LEN
            || (cmd.dstarg as usize) >= IPC_CALL_LEN
        {
            return Err(ErrorCode::EINVAL);
        }
        if op == IrqOp::Predicate {
            // Jumping just past the last command is legal; past that is not.
            if cmd.value > (cmds.len() - i) as Sysarg {
                return Err(ErrorCode::EINVAL);
            }
        }
        decoded.push((op, *cmd));
    }
    Ok(decoded)
}

/// Validates a program and maps its PIO ranges into kernel space, rewriting
/// each command's address from physical to kernel-virtual. Any address used
/// by a PIO command must fall inside a declared range.
pub fn validate(code: UnvalidatedCode) -> Result<ValidatedProgram, ErrorCode> {
    if code.ranges.len() > IRQ_MAX_RANGE_COUNT
        || code.cmds.len() > IRQ_MAX_PROG_SIZE
    {
        return Err(ErrorCode::ELIMIT);
    }
    let decoded = code_check(&code.cmds)?;

    let mut mapped: Vec<MappedRange> = Vec::with_capacity(code.ranges.len());
    let unmap_all = |mapped: &[MappedRange]| {
        for r in mapped {
            arch::km_unmap(r.kbase, r.size);
        }
    };
    for r in &code.ranges {
        match arch::km_map(r.base, r.size) {
            Some(kbase) => mapped.push(MappedRange {
                pbase: r.base,
                kbase,
                size: r.size,
            }),
            None => {
                unmap_all(&mapped);
                return Err(ErrorCode::ENOMEM);
            }
        }
    }

    let mut cmds = Vec::with_capacity(decoded.len());
    for (op, cmd) in decoded {
        let addr = match op.pio_width() {
            None => cmd.addr,
            Some(width) => {
                let range = mapped.iter().find(|r| {
                    cmd.addr >= r.pbase
                        && cmd.addr + width as Sysarg <= r.pbase + r.size
                });
                match range {
                    Some(r) => r.kbase + (cmd.addr - r.pbase),
                    None => {
                        unmap_all(&mapped);
                        return Err(ErrorCode::EINVAL);
                    }
                }
            }
        };
        cmds.push(DecodedCmd {
            op,
            dstarg: cmd.dstarg as usize,
            srcarg: cmd.srcarg as usize,
            addr,
            value: cmd.value,
        });
    }

    Ok(ValidatedProgram {
        ranges: mapped,
        cmds,
    })
}

/// Runs a validated program over the scratch file. Terminates within
/// `cmds.len()` steps: predicate jumps only move forward.
fn execute(
    code: &ValidatedProgram,
    scratch: &mut [u32; IPC_CALL_LEN],
) -> IrqOwnership {
    let mut i = 0;
    while i < code.cmds.len() {
        let cmd = &code.cmds[i];
        match cmd.op {
            IrqOp::PioRead8 => {
                scratch[cmd.dstarg] = arch::pio_read_8(cmd.addr) as u32;
            }
            IrqOp::PioRead16 => {
                scratch[cmd.dstarg] = arch::pio_read_16(cmd.addr) as u32;
            }
            IrqOp::PioRead32 => {
                scratch[cmd.dstarg] = arch::pio_read_32(cmd.addr);
            }
            IrqOp::PioWrite8 => {
                arch::pio_write_8(cmd.addr, cmd.value as u8);
            }
            IrqOp::PioWrite16 => {
                arch::pio_write_16(cmd.addr, cmd.value as u16);
            }
            IrqOp::PioWrite32 => {
                arch::pio_write_32(cmd.addr, cmd.value as u32);
            }
            IrqOp::PioWriteA8 => {
                arch::pio_write_8(cmd.addr, scratch[cmd.srcarg] as u8);
            }
            IrqOp::PioWriteA16 => {
                arch::pio_write_16(cmd.addr, scratch[cmd.srcarg] as u16);
            }
            IrqOp::PioWriteA32 => {
                arch::pio_write_32(cmd.addr, scratch[cmd.srcarg]);
            }
            IrqOp::Load => {
                scratch[cmd.dstarg] = cmd.value as u32;
            }
            IrqOp::And => {
                scratch[cmd.dstarg] = scratch[cmd.srcarg] & cmd.value as u32;
            }
            IrqOp::Predicate => {
                if scratch[cmd.srcarg] == 0 {
                    i += cmd.value;
                }
            }
            IrqOp::Accept => return IrqOwnership::Accept,
            IrqOp::Decline => return IrqOwnership::Decline,
        }
        i += 1;
    }
    IrqOwnership::Decline
}

struct IrqInner {
    /// Cleared on unsubscribe so a line mid-teardown declines.
    notify: bool,
    answerbox: Weak<Answerbox>,
    imethod: Sysarg,
    code: Option<ValidatedProgram>,
    scratch: [u32; IPC_CALL_LEN],
    /// Sequence number stamped into each notification.
    counter: Sysarg,
}

/// Kernel object representing one subscription on an interrupt line.
pub struct IrqObject {
    pub inr: u32,
    inner: IrqSpinlock<IrqInner>,
}

/// Registered subscriptions, by interrupt number. An interrupt line may have
/// several owners; they are polled in subscription order.
static IRQ_TABLE: IrqSpinlock<BTreeMap<u32, Vec<Arc<IrqObject>>>> =
    IrqSpinlock::new(BTreeMap::new());

/// Subscribes `task`'s answerbox to interrupt `inr`. Notifications carry
/// `imethod` and the program's scratch payload. Returns a capability handle
/// for unsubscription.
pub fn subscribe(
    task: &Task,
    inr: u32,
    imethod: Sysarg,
    code: Option<UnvalidatedCode>,
) -> Result<CallHandle, ErrorCode> {
    let program = match code {
        Some(c) => Some(validate(c)?),
        None => None,
    };
    let obj = Arc::new(IrqObject {
        inr,
        inner: IrqSpinlock::new(IrqInner {
            notify: true,
            answerbox: Arc::downgrade(&task.answerbox),
            imethod,
            code: program,
            scratch: [0; IPC_CALL_LEN],
            counter: 0,
        }),
    });

    IRQ_TABLE
        .lock()
        .entry(inr)
        .or_default()
        .push(Arc::clone(&obj));

    match task.irq_caps.lock().alloc(Arc::clone(&obj)) {
        Ok(handle) => Ok(handle),
        Err(e) => {
            unhash(&obj);
            Err(e)
        }
    }
}

fn unhash(obj: &Arc<IrqObject>) {
    let mut table = IRQ_TABLE.lock();
    if let Some(owners) = table.get_mut(&obj.inr) {
        owners.retain(|o| !Arc::ptr_eq(o, obj));
        if owners.is_empty() {
            table.remove(&obj.inr);
        }
    }
}

/// Revokes the subscription named by `handle`. Notifications already queued
/// on the answerbox remain deliverable.
pub fn unsubscribe(task: &Task, handle: CallHandle) -> Result<(), ErrorCode> {
    let obj = task
        .irq_caps
        .lock()
        .take(handle.without_tags())
        .ok_or(ErrorCode::ENOENT)?;
    obj.inner.lock().notify = false;
    unhash(&obj);
    Ok(())
}

/// Hard-IRQ entry: polls the line's owners in subscription order until one
/// claims the interrupt, then ships its notification.
pub fn dispatch(inr: u32) {
    let owners: Vec<Arc<IrqObject>> = match IRQ_TABLE.lock().get(&inr) {
        Some(v) => v.clone(),
        None => {
            klog!("irq: spurious interrupt {}", inr);
            return;
        }
    };

    for obj in &owners {
        // Claim under the object's lock; on accept, snapshot what the
        // notification needs and deliver after unlocking.
        let accepted = {
            let mut inner = obj.inner.lock();
            if !inner.notify {
                continue;
            }
            let Some(code) = inner.code.take() else { continue };
            let mut scratch = inner.scratch;
            let verdict = execute(&code, &mut scratch);
            inner.scratch = scratch;
            inner.code = Some(code);
            if verdict != IrqOwnership::Accept {
                continue;
            }
            inner.counter += 1;
            Some((
                inner.answerbox.clone(),
                inner.imethod,
                inner.scratch,
                inner.counter,
            ))
        };
        if let Some((bx, imethod, scratch, counter)) = accepted {
            if let Some(bx) = bx.upgrade() {
                let mut call = Call::new();
                call.flags |= CallFlags::NOTIF;
                call.private = counter;
                call.data.imethod = imethod;
                // Slot 0 carries the sequence label; the payload proper is
                // scratch 1..5.
                call.data.args[0] = counter;
                for n in 1..IPC_CALL_LEN {
                    call.data.args[n] = scratch[n] as Sysarg;
                }
                ipc::send_notification(&bx, call);
            }
            return;
        }
    }
    klog!("irq: no owner accepted interrupt {}", inr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testsupport;
    use crate::waitq::SleepFlags;

    fn cmd(op: IrqOp, dstarg: u8, srcarg: u8, addr: Sysarg, value: Sysarg) -> IrqCmd {
        IrqCmd {
            opcode: op as u8,
            dstarg,
            srcarg,
            _pad: 0,
            addr,
            value,
        }
    }

    #[test]
    fn rejects_unknown_opcodes_and_bad_scratch_indices() {
        let bad_op = UnvalidatedCode {
            ranges: alloc::vec![],
            cmds: alloc::vec![IrqCmd {
                opcode: 0xEE,
                dstarg: 0,
                srcarg: 0,
                _pad: 0,
                addr: 0,
                value: 0,
            }],
        };
        assert_eq!(validate(bad_op).err(), Some(ErrorCode::EINVAL));

        let bad_dst = UnvalidatedCode {
            ranges: alloc::vec![],
            cmds: alloc::vec![cmd(
                IrqOp::Load,
                IPC_CALL_LEN as u8,
                0,
                0,
                1
            )],
        };
        assert_eq!(validate(bad_dst).err(), Some(ErrorCode::EINVAL));
    }

    #[test]
    fn rejects_predicate_jumps_past_the_end() {
        let code = UnvalidatedCode {
            ranges: alloc::vec![],
            cmds: alloc::vec![
                cmd(IrqOp::Load, 1, 0, 0, 1),
                cmd(IrqOp::Predicate, 0, 1, 0, 3),
                cmd(IrqOp::Accept, 0, 0, 0, 0),
            ],
        };
        assert_eq!(validate(code).err(), Some(ErrorCode::EINVAL));

        // Jumping exactly to the end is legal.
        let ok = UnvalidatedCode {
            ranges: alloc::vec![],
            cmds: alloc::vec![
                cmd(IrqOp::Load, 1, 0, 0, 1),
                cmd(IrqOp::Predicate, 0, 1, 0, 2),
                cmd(IrqOp::Accept, 0, 0, 0, 0),
            ],
        };
        assert!(validate(ok).is_ok());
    }

    #[test]
    fn rejects_oversized_programs() {
        let code = UnvalidatedCode {
            ranges: alloc::vec![],
            cmds: alloc::vec![cmd(IrqOp::Accept, 0, 0, 0, 0); IRQ_MAX_PROG_SIZE + 1],
        };
        assert_eq!(validate(code).err(), Some(ErrorCode::ELIMIT));
    }

    #[test]
    fn rejects_pio_addresses_outside_declared_ranges() {
        let code = UnvalidatedCode {
            ranges: alloc::vec![IrqPioRange { base: 0x4000, size: 4 }],
            cmds: alloc::vec![
                cmd(IrqOp::PioRead8, 1, 0, 0x4008, 0),
                cmd(IrqOp::Accept, 0, 0, 0, 0),
            ],
        };
        assert_eq!(validate(code).err(), Some(ErrorCode::EINVAL));
    }

    #[test]
    fn interpreter_filters_through_pio_and_predicates() {
        let _g = testsupport::serialize();
        testsupport::boot(1);

        // Device status register at physical 0x5000, value 0x81.
        let kva = arch::km_map(0x5000, 4).unwrap();
        arch::register_pio_region(kva, 4);
        arch::pio_write_8(kva, 0x81);

        let code = UnvalidatedCode {
            ranges: alloc::vec![IrqPioRange { base: 0x5000, size: 4 }],
            cmds: alloc::vec![
                // status -> scratch1; keep the ready bit; decline if clear.
                cmd(IrqOp::PioRead8, 1, 0, 0x5000, 0),
                cmd(IrqOp::And, 2, 1, 0, 0x80),
                cmd(IrqOp::Predicate, 0, 2, 0, 2),
                cmd(IrqOp::Accept, 0, 0, 0, 0),
                cmd(IrqOp::Decline, 0, 0, 0, 0),
            ],
        };
        let program = validate(code).unwrap();
        let mut scratch = [0u32; IPC_CALL_LEN];
        assert_eq!(
            execute(&program, &mut scratch),
            IrqOwnership::Accept
        );
        assert_eq!(scratch[1], 0x81);
        assert_eq!(scratch[2], 0x80);

        // Clear the ready bit; the predicate now skips to the decline.
        arch::pio_write_8(kva, 0x01);
        let mut scratch = [0u32; IPC_CALL_LEN];
        assert_eq!(
            execute(&program, &mut scratch),
            IrqOwnership::Decline
        );
    }

    #[test]
    fn accepted_interrupts_notify_the_subscribed_answerbox() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let task = testsupport::make_task();

        let code = UnvalidatedCode {
            ranges: alloc::vec![],
            cmds: alloc::vec![
                cmd(IrqOp::Load, 1, 0, 0, 0x55),
                cmd(IrqOp::Accept, 0, 0, 0, 0),
            ],
        };
        let handle = subscribe(&task, 9, 0x100, Some(code)).unwrap();

        dispatch(9);
        dispatch(9);

        for expected_label in 1..=2 {
            let n = ipc::wait_for_call(
                &task.answerbox,
                0,
                SleepFlags::NON_BLOCKING,
            )
            .unwrap();
            assert!(n.flags.contains(CallFlags::NOTIF));
            assert_eq!(n.data.imethod, 0x100);
            assert_eq!(n.data.args[1], 0x55);
            assert_eq!(n.data.args[0], expected_label);
        }

        unsubscribe(&task, handle).unwrap();
        // The line is clear again; nothing further arrives.
        dispatch(9);
        assert!(ipc::wait_for_call(
            &task.answerbox,
            0,
            SleepFlags::NON_BLOCKING
        )
        .is_none());
    }

    #[test]
    fn codeless_subscriptions_decline() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let task = testsupport::make_task();
        let handle = subscribe(&task, 11, 0x200, None).unwrap();
        dispatch(11);
        assert!(ipc::wait_for_call(
            &task.answerbox,
            0,
            SleepFlags::NON_BLOCKING
        )
        .is_none());
        unsubscribe(&task, handle).unwrap();
    }

    #[test]
    fn unsubscribe_requires_a_live_handle() {
        let _g = testsupport::serialize();
        testsupport::boot(1);
        let task = testsupport::make_task();
        let handle = subscribe(&task, 12, 0x300, None).unwrap();
        unsubscribe(&task, handle).unwrap();
        assert_eq!(
            unsubscribe(&task, handle).err(),
            Some(ErrorCode::ENOENT)
        );
    }
}
