// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between kernel and applications.

#![no_std]

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Native machine word, the unit of all syscall arguments and results.
pub type Sysarg = usize;

/// Number of argument slots in an IPC message, and simultaneously the size of
/// the IRQ top-half scratch register file.
pub const IPC_CALL_LEN: usize = 6;

/// Number of phone slots in a task's phone table.
pub const IPC_MAX_PHONES: usize = 32;

/// Maximum number of outstanding asynchronous requests per task. Send attempts
/// beyond this fail with `IPC_CALLRET_TEMPORARY` without allocating anything.
pub const IPC_MAX_ASYNC_CALLS: usize = 4000;

/// Maximum number of instructions in an IRQ top-half program.
pub const IRQ_MAX_PROG_SIZE: usize = 64;

/// Maximum number of PIO ranges an IRQ top-half program may declare.
pub const IRQ_MAX_RANGE_COUNT: usize = 8;

/// Success word returned in the syscall result slot.
pub const EOK: Sysarg = 0;

/// Error codes surfaced to userspace.
///
/// The wire form of an error is its value sign-extended into the native result
/// word, so all of these appear to userspace as words with the top bits set.
/// `EOK` (zero) is deliberately not a variant: kernel code models fallible
/// operations as `Result<_, ErrorCode>` and the absence of an error is the
/// `Ok` branch, not a code.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(non_camel_case_types)]
#[repr(i32)]
pub enum ErrorCode {
    /// Phone, call, or futex mapping absent.
    ENOENT = -1,
    /// Allocation failure.
    ENOMEM = -2,
    /// Table full (phones, async calls, IRQ program size).
    ELIMIT = -3,
    /// Translation of `EHANGUP` observed on a forwarded call.
    EFORWARD = -5,
    /// Missing capability.
    EPERM = -6,
    /// Peer has closed the phone.
    EHANGUP = -7,
    /// Copy to or from userspace failed.
    EBADMEM = -9,
    /// Timed sleep elapsed.
    TIMEOUT = -12,
    /// Malformed arguments, invalid IRQ code, bad phone state.
    EINVAL = -13,
    /// Transient failure, retry.
    EAGAIN = -14,
    /// Interruptible sleep was woken by cancellation.
    INTERRUPTED = -16,
}

impl ErrorCode {
    /// Folds the code into a syscall result word.
    pub const fn as_word(self) -> Sysarg {
        self as i32 as isize as Sysarg
    }
}

impl core::convert::TryFrom<Sysarg> for ErrorCode {
    type Error = ();

    fn try_from(w: Sysarg) -> Result<Self, Self::Error> {
        match w as isize {
            -1 => Ok(Self::ENOENT),
            -2 => Ok(Self::ENOMEM),
            -3 => Ok(Self::ELIMIT),
            -5 => Ok(Self::EFORWARD),
            -6 => Ok(Self::EPERM),
            -7 => Ok(Self::EHANGUP),
            -9 => Ok(Self::EBADMEM),
            -12 => Ok(Self::TIMEOUT),
            -13 => Ok(Self::EINVAL),
            -14 => Ok(Self::EAGAIN),
            -16 => Ok(Self::INTERRUPTED),
            _ => Err(()),
        }
    }
}

/// Transient result of an asynchronous send: the per-task outstanding-call
/// budget is exhausted, retry after draining answers.
pub const IPC_CALLRET_TEMPORARY: Sysarg = -2isize as Sysarg;

/// Fatal result of an asynchronous send: the phone id named by the caller can
/// never carry a call.
pub const IPC_CALLRET_FATAL: Sysarg = -1isize as Sysarg;

// Kernel-interpreted methods. A method at or below `IPC_M_LAST_SYSTEM`
// triggers kernel pre/post-processing hooks on both ends of the call.

/// Sent by the kernel to a callee when the caller side of a phone hangs up.
pub const IPC_M_PHONE_HUNGUP: Sysarg = 1;
/// Caller requests a new connection to the callee's answerbox.
pub const IPC_M_CONNECT_ME_TO: Sysarg = 2;
/// Caller offers the callee a new connection back to the caller.
pub const IPC_M_CONNECT_TO_ME: Sysarg = 3;
/// Address-space area transfer, caller to callee.
pub const IPC_M_AS_AREA_SEND: Sysarg = 4;
/// Address-space area transfer, callee to caller.
pub const IPC_M_AS_AREA_RECV: Sysarg = 5;
/// Highest method number the kernel interprets.
pub const IPC_M_LAST_SYSTEM: Sysarg = 31;
/// First method number with purely application-defined meaning.
pub const IPC_FIRST_USER_METHOD: Sysarg = IPC_M_LAST_SYSTEM + 1;

/// IPC message payload as copied to and from userspace.
///
/// One of these travels in each direction of a call: on the way in, `imethod`
/// and `args` carry the request; on the way back, `retval` carries the
/// callee's response code and `args` whatever reply arguments it set.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct IpcData {
    /// Interface and method of the request.
    pub imethod: Sysarg,
    /// Scalar arguments. Slot 0 is reserved for kernel use; IRQ notifications
    /// and the fast syscall forms populate slots 1 and up.
    pub args: [Sysarg; IPC_CALL_LEN],
    /// Response code filled in by the answer.
    pub retval: Sysarg,
}

impl IpcData {
    pub fn arg(&self, n: usize) -> Sysarg {
        self.args[n]
    }

    pub fn set_arg(&mut self, n: usize, v: Sysarg) {
        self.args[n] = v;
    }

    /// Stores an error code (or `EOK`) in the response slot.
    pub fn set_retval(&mut self, v: Sysarg) {
        self.retval = v;
    }

    pub fn set_retval_code(&mut self, e: ErrorCode) {
        self.retval = e.as_word();
    }

    /// Reads the response slot back as an error code, if it holds one.
    pub fn retval_code(&self) -> Option<ErrorCode> {
        ErrorCode::try_from(self.retval).ok()
    }
}

// Tag bits carried in the low bits of a call id returned by
// `ipc_wait_for_call`. Call handles reserve these bits, so a handle with both
// clear designates a plain incoming request.

/// The call id designates an IRQ notification; it must not be answered.
pub const IPC_CALLID_NOTIFICATION: Sysarg = 0x01;
/// The call id designates the answer to an earlier asynchronous call.
pub const IPC_CALLID_ANSWERED: Sysarg = 0x02;

/// Type used to track handle generation numbers.
///
/// Generations wrap at 14 bits so a handle word packs as
/// `{ tag:2 | gen:14 | index:16 }`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Generation(u16);

impl Generation {
    pub const ZERO: Self = Self(0);
    pub const BITS: u32 = 14;
    const MASK: u16 = (1 << Self::BITS) - 1;

    pub fn next(self) -> Self {
        Generation(self.0.wrapping_add(1) & Self::MASK)
    }
}

impl From<u16> for Generation {
    fn from(x: u16) -> Self {
        Self(x & Self::MASK)
    }
}

impl From<Generation> for u16 {
    fn from(g: Generation) -> Self {
        g.0
    }
}

/// Names a particular incarnation of a call (or other kernel object) within a
/// task-scoped handle table.
///
/// A `CallHandle` combines a table index with a generation number that is
/// bumped each time the slot is reused, so a stale handle retained by
/// userspace can never alias a newer call. The low `TAG_BITS` are kept clear
/// by the allocator so `ipc_wait_for_call` can report `IPC_CALLID_*` tags in
/// band, the way the original ABI reserved the low bits of an aligned
/// pointer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(transparent)]
pub struct CallHandle(pub Sysarg);

impl CallHandle {
    pub const TAG_BITS: u32 = 2;
    pub const INDEX_BITS: u32 = 16;
    const INDEX_MASK: Sysarg = (1 << Self::INDEX_BITS) - 1;
    const GEN_MASK: Sysarg = (1 << Generation::BITS) - 1;

    /// Fabricates a handle for a known index and generation, with clear tags.
    pub const fn for_index_and_gen(index: usize, gen: u16) -> Self {
        CallHandle(
            (index & Self::INDEX_MASK as usize) << Self::TAG_BITS
                | (gen as Sysarg & Self::GEN_MASK)
                    << (Self::TAG_BITS + Self::INDEX_BITS),
        )
    }

    /// Extracts the table index.
    pub fn index(&self) -> usize {
        (self.0 >> Self::TAG_BITS) & Self::INDEX_MASK
    }

    /// Extracts the generation.
    pub fn generation(&self) -> Generation {
        Generation::from(
            ((self.0 >> (Self::TAG_BITS + Self::INDEX_BITS)) & Self::GEN_MASK)
                as u16,
        )
    }

    /// Extracts the tag bits.
    pub fn tags(&self) -> Sysarg {
        self.0 & ((1 << Self::TAG_BITS) - 1)
    }

    /// Returns the same handle with `tags` or-ed into the tag bits.
    pub fn with_tags(self, tags: Sysarg) -> Self {
        CallHandle(self.0 | (tags & ((1 << Self::TAG_BITS) - 1)))
    }

    /// Returns the same handle with the tag bits cleared, suitable for table
    /// lookup.
    pub fn without_tags(self) -> Self {
        CallHandle(self.0 & !((1 << Self::TAG_BITS) - 1))
    }
}

bitflags::bitflags! {
    /// Capability bits held by a task.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct TaskCaps: u32 {
        /// May perform privileged I/O management.
        const IO_MANAGER = 1 << 0;
        /// May subscribe to IRQ notifications.
        const IRQ_REG = 1 << 1;
    }
}

/// One instruction of an IRQ top-half program, as copied from userspace.
///
/// `addr` is a physical address at subscription time; the kernel rewrites it
/// to a kernel virtual address before the program is ever executed.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct IrqCmd {
    pub opcode: u8,
    pub dstarg: u8,
    pub srcarg: u8,
    pub _pad: u8,
    pub addr: Sysarg,
    pub value: Sysarg,
}

/// One physical PIO region an IRQ top-half program needs access to.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct IrqPioRange {
    pub base: Sysarg,
    pub size: Sysarg,
}

/// Userspace header describing an IRQ top-half program: two counted arrays.
#[derive(Copy, Clone, Debug, FromBytes, Immutable, KnownLayout)]
#[repr(C)]
pub struct IrqCode {
    pub rangecount: Sysarg,
    /// Userspace pointer to `rangecount` `IrqPioRange` records.
    pub ranges: Sysarg,
    pub cmdcount: Sysarg,
    /// Userspace pointer to `cmdcount` `IrqCmd` records.
    pub cmds: Sysarg,
}

/// Operations available to IRQ top-half programs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum IrqOp {
    PioRead8 = 0,
    PioRead16 = 1,
    PioRead32 = 2,
    PioWrite8 = 3,
    PioWrite16 = 4,
    PioWrite32 = 5,
    PioWriteA8 = 6,
    PioWriteA16 = 7,
    PioWriteA32 = 8,
    Load = 9,
    And = 10,
    Predicate = 11,
    Accept = 12,
    Decline = 13,
}

impl IrqOp {
    /// Width in bytes of the PIO access this operation performs, or `None`
    /// for operations that do not touch device memory.
    pub fn pio_width(self) -> Option<usize> {
        match self {
            Self::PioRead8 | Self::PioWrite8 | Self::PioWriteA8 => Some(1),
            Self::PioRead16 | Self::PioWrite16 | Self::PioWriteA16 => Some(2),
            Self::PioRead32 | Self::PioWrite32 | Self::PioWriteA32 => Some(4),
            _ => None,
        }
    }
}

impl core::convert::TryFrom<u8> for IrqOp {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::PioRead8),
            1 => Ok(Self::PioRead16),
            2 => Ok(Self::PioRead32),
            3 => Ok(Self::PioWrite8),
            4 => Ok(Self::PioWrite16),
            5 => Ok(Self::PioWrite32),
            6 => Ok(Self::PioWriteA8),
            7 => Ok(Self::PioWriteA16),
            8 => Ok(Self::PioWriteA32),
            9 => Ok(Self::Load),
            10 => Ok(Self::And),
            11 => Ok(Self::Predicate),
            12 => Ok(Self::Accept),
            13 => Ok(Self::Decline),
            _ => Err(()),
        }
    }
}

/// Enumeration of syscall numbers.
#[repr(u32)]
pub enum Sysnum {
    IpcCallSyncFast = 0,
    IpcCallSync = 1,
    IpcCallAsyncFast = 2,
    IpcCallAsync = 3,
    IpcForwardFast = 4,
    IpcAnswerFast = 5,
    IpcAnswer = 6,
    IpcHangup = 7,
    IpcWaitForCall = 8,
    IpcRegisterIrq = 9,
    IpcUnregisterIrq = 10,
    FutexSleep = 11,
    FutexWakeup = 12,
}

impl core::convert::TryFrom<u32> for Sysnum {
    type Error = ();

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::IpcCallSyncFast),
            1 => Ok(Self::IpcCallSync),
            2 => Ok(Self::IpcCallAsyncFast),
            3 => Ok(Self::IpcCallAsync),
            4 => Ok(Self::IpcForwardFast),
            5 => Ok(Self::IpcAnswerFast),
            6 => Ok(Self::IpcAnswer),
            7 => Ok(Self::IpcHangup),
            8 => Ok(Self::IpcWaitForCall),
            9 => Ok(Self::IpcRegisterIrq),
            10 => Ok(Self::IpcUnregisterIrq),
            11 => Ok(Self::FutexSleep),
            12 => Ok(Self::FutexWakeup),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_handle_round_trip() {
        let h = CallHandle::for_index_and_gen(0x1234, 0x3FF);
        assert_eq!(h.index(), 0x1234);
        assert_eq!(h.generation(), Generation::from(0x3FF));
        assert_eq!(h.tags(), 0);

        let t = h.with_tags(IPC_CALLID_ANSWERED);
        assert_eq!(t.tags(), IPC_CALLID_ANSWERED);
        assert_eq!(t.without_tags(), h);
        assert_eq!(t.index(), 0x1234);
    }

    #[test]
    fn generation_wraps_at_14_bits() {
        let g = Generation::from((1 << Generation::BITS) - 1);
        assert_eq!(g.next(), Generation::ZERO);
    }

    #[test]
    fn error_codes_survive_the_result_word() {
        for e in [
            ErrorCode::ENOENT,
            ErrorCode::EHANGUP,
            ErrorCode::EFORWARD,
            ErrorCode::TIMEOUT,
            ErrorCode::INTERRUPTED,
        ] {
            assert_eq!(ErrorCode::try_from(e.as_word()), Ok(e));
        }
        assert_eq!(ErrorCode::try_from(EOK), Err(()));
    }

    #[test]
    fn handles_never_collide_with_tag_bits() {
        // Every index/generation combination leaves the low bits clear.
        let h = CallHandle::for_index_and_gen(usize::MAX, u16::MAX);
        assert_eq!(h.tags(), 0);
    }
}
