// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture-independent syscall dispatch.
//!
//! The arch-specific entry sequence stores the caller's registers and calls
//! `syscall_entry` with the syscall number and raw argument words. Handlers
//! return a single machine word; errors travel as negative words.

use abi::{ErrorCode, Sysarg, Sysnum};
use core::convert::TryFrom;

use crate::futex;
use crate::sysipc;

/// Entry point accessed by the arch-specific syscall entry sequence.
pub fn syscall_entry(
    nr: u32,
    a1: Sysarg,
    a2: Sysarg,
    a3: Sysarg,
    a4: Sysarg,
) -> Sysarg {
    match Sysnum::try_from(nr) {
        Ok(Sysnum::IpcCallSyncFast) => {
            sysipc::sys_ipc_call_sync_fast(a1, a2, a3, a4)
        }
        Ok(Sysnum::IpcCallSync) => sysipc::sys_ipc_call_sync(a1, a2, a3),
        Ok(Sysnum::IpcCallAsyncFast) => {
            sysipc::sys_ipc_call_async_fast(a1, a2, a3, a4)
        }
        Ok(Sysnum::IpcCallAsync) => sysipc::sys_ipc_call_async(a1, a2),
        Ok(Sysnum::IpcForwardFast) => {
            sysipc::sys_ipc_forward_fast(a1, a2, a3, a4)
        }
        Ok(Sysnum::IpcAnswerFast) => {
            sysipc::sys_ipc_answer_fast(a1, a2, a3, a4)
        }
        Ok(Sysnum::IpcAnswer) => sysipc::sys_ipc_answer(a1, a2),
        Ok(Sysnum::IpcHangup) => sysipc::sys_ipc_hangup(a1),
        Ok(Sysnum::IpcWaitForCall) => {
            sysipc::sys_ipc_wait_for_call(a1, a2, a3)
        }
        Ok(Sysnum::IpcRegisterIrq) => {
            sysipc::sys_ipc_register_irq(a1, a2, a3)
        }
        Ok(Sysnum::IpcUnregisterIrq) => sysipc::sys_ipc_unregister_irq(a1),
        Ok(Sysnum::FutexSleep) => futex::sys_futex_sleep(a1),
        Ok(Sysnum::FutexWakeup) => futex::sys_futex_wakeup(a1),
        Err(_) => ErrorCode::EINVAL.as_word(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bogus_syscall_numbers_fail_cleanly() {
        assert_eq!(
            syscall_entry(0xFFFF, 0, 0, 0, 0),
            ErrorCode::EINVAL.as_word()
        );
    }
}
