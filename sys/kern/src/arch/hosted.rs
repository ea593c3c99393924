// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted stand-in for the machine layer.
//!
//! This module provides the same names a real architecture module would, but
//! backed by plain process state: the interrupt mask is a counter, PIO space
//! and page tables are maps that test code can populate, and the context
//! switch operations are stubs that panic if actually exercised. Everything
//! above this layer is portable kernel code, and this is what lets it build
//! and run its test suite off-target.

use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use abi::{ErrorCode, Sysarg};
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use crate::spinlock::IrqSpinlock;

#[cfg(all(feature = "klog", test))]
macro_rules! klog {
    ($s:expr) => { std::eprintln!($s) };
    ($s:expr, $($tt:tt)*) => { std::eprintln!($s, $($tt)*) };
}

#[cfg(not(all(feature = "klog", test)))]
macro_rules! klog {
    ($s:expr) => {};
    ($s:expr, $($tt:tt)*) => {};
}

macro_rules! uassert {
    ($cond:expr) => {
        if !$cond {
            panic!("Assertion failed!");
        }
    };
}

macro_rules! uassert_eq {
    ($cond1:expr, $cond2:expr) => {
        if $cond1 != $cond2 {
            panic!("Assertion failed!");
        }
    };
}

/// Smallest page the translation fakes deal in.
pub const PAGE_SIZE: Sysarg = 4096;

/// Base of the window where `km_map` places device mappings.
pub const KM_BASE: Sysarg = 1 << (usize::BITS - 2);

// Interrupt mask, modeled as a disable depth. Zero means enabled.
static IPL_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Saved interrupt state returned by `interrupts_disable`. Holding one of
/// these is the license to run without preemption; hand it back via
/// `interrupts_restore`.
#[derive(Copy, Clone, Debug)]
#[must_use]
pub struct Ipl {
    was_enabled: bool,
}

impl Ipl {
    pub fn enabled(&self) -> bool {
        self.was_enabled
    }
}

/// Masks interrupts on the local CPU, returning the prior state.
pub fn interrupts_disable() -> Ipl {
    let prev = IPL_DEPTH.fetch_add(1, Ordering::SeqCst);
    Ipl {
        was_enabled: prev == 0,
    }
}

/// Undoes one `interrupts_disable`, restoring the state its token recorded.
pub fn interrupts_restore(_ipl: Ipl) {
    let _ = IPL_DEPTH.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| {
        Some(d.saturating_sub(1))
    });
}

/// Unconditionally unmasks interrupts. Only the idle loop uses this; any
/// outstanding `Ipl` tokens are void afterwards.
pub fn interrupts_enable() {
    IPL_DEPTH.store(0, Ordering::SeqCst);
}

pub fn interrupts_enabled() -> bool {
    IPL_DEPTH.load(Ordering::SeqCst) == 0
}

// CPU identity. On real hardware this reads a system register; here it is a
// process global that the bootstrap (or a test fixture) assigns.
static CURRENT_CPU: AtomicUsize = AtomicUsize::new(0);

pub fn current_cpu_id() -> usize {
    CURRENT_CPU.load(Ordering::Relaxed)
}

pub fn set_current_cpu(id: usize) {
    CURRENT_CPU.store(id, Ordering::Relaxed);
}

/// Saved CPU context of a suspended thread. The hosted rendition records only
/// where execution would resume; it cannot actually be resumed.
#[derive(Debug, Default)]
pub struct Context {
    pub pc: Sysarg,
    pub sp: Sysarg,
}

/// Result of `context_save`: either we just stored the context, or control
/// has come back here through a later `context_restore`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SaveResult {
    Saved,
    Resumed,
}

pub fn context_save(_ctx: &mut Context) -> SaveResult {
    SaveResult::Saved
}

pub fn context_restore(_ctx: &Context) -> ! {
    panic!("hosted arch cannot restore a thread context");
}

/// Seeds a fresh context so that restoring it would enter `entry(arg)` on the
/// given stack.
pub fn context_init(ctx: &mut Context, entry: Sysarg, stack_top: Sysarg) {
    ctx.pc = entry;
    ctx.sp = stack_top;
}

/// Abandons the current stack and runs `f` on the stack ending at
/// `stack_top`.
///
/// The hosted version cannot actually move the stack pointer; it calls
/// through on the current stack, which is sufficient for the one caller
/// that never returns.
pub unsafe fn run_on_scheduler_stack(_stack_top: Sysarg, f: fn() -> !) -> ! {
    f()
}

/// Waits for an interrupt with interrupts enabled.
pub fn cpu_sleep() {
    core::hint::spin_loop();
}

pub fn halt() -> ! {
    panic!("halt");
}

// FPU. The "hardware" register file is a process global so the lazy-switch
// machinery above this layer can be exercised.

pub const FPU_CONTEXT_WORDS: usize = 16;

pub type FpuContext = [u32; FPU_CONTEXT_WORDS];

static FPU_HW: IrqSpinlock<FpuContext> =
    IrqSpinlock::new([0; FPU_CONTEXT_WORDS]);
static FPU_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn fpu_enable() {
    FPU_ENABLED.store(true, Ordering::Relaxed);
}

pub fn fpu_disable() {
    FPU_ENABLED.store(false, Ordering::Relaxed);
}

pub fn fpu_enabled() -> bool {
    FPU_ENABLED.load(Ordering::Relaxed)
}

/// Resets the FPU to its power-on state.
pub fn fpu_init() {
    *FPU_HW.lock() = [0; FPU_CONTEXT_WORDS];
}

pub fn fpu_context_save(ctx: &mut FpuContext) {
    *ctx = *FPU_HW.lock();
}

pub fn fpu_context_restore(ctx: &FpuContext) {
    *FPU_HW.lock() = *ctx;
}

/// Deposits a value in a live FPU register, as user code touching the FPU
/// would.
pub fn fpu_poke(reg: usize, value: u32) {
    FPU_HW.lock()[reg] = value;
}

pub fn fpu_peek(reg: usize) -> u32 {
    FPU_HW.lock()[reg]
}

// PIO space: a set of byte regions keyed by base address. Reads outside any
// region float high, as a bus without a device would.

static PIO_SPACE: IrqSpinlock<BTreeMap<Sysarg, Vec<u8>>> =
    IrqSpinlock::new(BTreeMap::new());

/// Installs a zero-filled device region at `base` (a kernel virtual address,
/// i.e. post-`km_map`).
pub fn register_pio_region(base: Sysarg, size: usize) {
    PIO_SPACE.lock().insert(base, vec![0; size]);
}

fn pio_access<R>(
    addr: Sysarg,
    width: usize,
    f: impl FnOnce(&mut [u8]) -> R,
) -> Option<R> {
    let mut space = PIO_SPACE.lock();
    let (&base, region) = space.range_mut(..=addr).next_back()?;
    let off = addr - base;
    if off + width as Sysarg > region.len() as Sysarg {
        return None;
    }
    Some(f(&mut region[off..off + width]))
}

pub fn pio_read_8(addr: Sysarg) -> u8 {
    pio_access(addr, 1, |b| b[0]).unwrap_or(!0)
}

pub fn pio_read_16(addr: Sysarg) -> u16 {
    pio_access(addr, 2, |b| u16::from_le_bytes([b[0], b[1]])).unwrap_or(!0)
}

pub fn pio_read_32(addr: Sysarg) -> u32 {
    pio_access(addr, 4, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or(!0)
}

pub fn pio_write_8(addr: Sysarg, value: u8) {
    let _ = pio_access(addr, 1, |b| b[0] = value);
}

pub fn pio_write_16(addr: Sysarg, value: u16) {
    let _ = pio_access(addr, 2, |b| b.copy_from_slice(&value.to_le_bytes()));
}

pub fn pio_write_32(addr: Sysarg, value: u32) {
    let _ = pio_access(addr, 4, |b| b.copy_from_slice(&value.to_le_bytes()));
}

/// Maps `size` bytes of physical space at `phys` into the kernel window,
/// returning the kernel virtual address. The hosted window is a fixed offset,
/// so the mapping can never be exhausted.
pub fn km_map(phys: Sysarg, _size: Sysarg) -> Option<Sysarg> {
    Some(KM_BASE + phys)
}

pub fn km_unmap(_kva: Sysarg, _size: Sysarg) {}

// Page translation. Address spaces are named by bare integers; the fake
// tables map (address space, page) to frame.

static PAGE_TABLES: IrqSpinlock<BTreeMap<(u64, Sysarg), Sysarg>> =
    IrqSpinlock::new(BTreeMap::new());

/// Installs a translation for one page of `as_id`.
pub fn map_page(as_id: u64, va: Sysarg, pa: Sysarg) {
    uassert_eq!(va % PAGE_SIZE, 0);
    uassert_eq!(pa % PAGE_SIZE, 0);
    PAGE_TABLES.lock().insert((as_id, va), pa);
}

pub fn unmap_page(as_id: u64, va: Sysarg) {
    PAGE_TABLES.lock().remove(&(as_id, va));
}

/// Walks the page tables of `as_id` for the physical address backing `va`,
/// if any.
pub fn virt_to_phys(as_id: u64, va: Sysarg) -> Option<Sysarg> {
    let page = va & !(PAGE_SIZE - 1);
    let frame = *PAGE_TABLES.lock().get(&(as_id, page))?;
    Some(frame + (va - page))
}

// Address-space areas, for the IPC area-transfer hooks. The hosted tables
// record (address space, area base) -> size.

static AS_AREAS: IrqSpinlock<BTreeMap<(u64, Sysarg), Sysarg>> =
    IrqSpinlock::new(BTreeMap::new());

static CURRENT_AS: AtomicU64 = AtomicU64::new(0);

pub fn register_as_area(as_id: u64, base: Sysarg, size: Sysarg) {
    AS_AREAS.lock().insert((as_id, base), size);
}

/// Size of the address-space area starting at `base`, or `None` if no such
/// area exists.
pub fn as_area_size(as_id: u64, base: Sysarg) -> Option<Sysarg> {
    AS_AREAS.lock().get(&(as_id, base)).copied()
}

/// Shares an area of `src_as` into `dst_as`. The hosted version only records
/// the destination area so a subsequent lookup sees it.
pub fn as_area_share(
    src_as: u64,
    src_base: Sysarg,
    size: Sysarg,
    dst_as: u64,
    dst_base: Sysarg,
    _flags: Sysarg,
) -> Result<(), ErrorCode> {
    if as_area_size(src_as, src_base).is_none() {
        return Err(ErrorCode::ENOENT);
    }
    register_as_area(dst_as, dst_base, size);
    Ok(())
}

/// Activates the address space on this CPU.
pub fn as_install(as_id: u64) {
    CURRENT_AS.store(as_id, Ordering::Relaxed);
}

pub fn current_as() -> u64 {
    CURRENT_AS.load(Ordering::Relaxed)
}

/// Releases a frame backing a user stack.
pub fn frame_free(_addr: Sysarg) {}

/// Copies `dst.len()` bytes from userspace at `addr`.
///
/// The hosted address space *is* the test process, so this is a raw copy;
/// only null is rejected. The caller has already validated the slice shape
/// (alignment, wrap-around) via `umem`.
pub fn copy_from_user(addr: Sysarg, dst: &mut [u8]) -> Result<(), ()> {
    if addr == 0 {
        return Err(());
    }
    unsafe {
        core::ptr::copy_nonoverlapping(
            addr as *const u8,
            dst.as_mut_ptr(),
            dst.len(),
        );
    }
    Ok(())
}

/// Copies `src` to userspace at `addr`. See `copy_from_user`.
pub fn copy_to_user(addr: Sysarg, src: &[u8]) -> Result<(), ()> {
    if addr == 0 {
        return Err(());
    }
    unsafe {
        core::ptr::copy_nonoverlapping(
            src.as_ptr(),
            addr as *mut u8,
            src.len(),
        );
    }
    Ok(())
}
