//! x86_64 context switching implementation
//!
//! Uses inline assembly for the voluntary switch. Stable since Rust 1.88.

use std::arch::naked_asm;

/// Callee-saved register frame per the System V AMD64 ABI, plus the stack
/// pointer and resume address. Field order is load-bearing: the assembly
/// below addresses these by fixed offsets.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Context {
    pub rsp: u64, // 0x00
    pub rip: u64, // 0x08
    pub rbx: u64, // 0x10
    pub rbp: u64, // 0x18
    pub r12: u64, // 0x20
    pub r13: u64, // 0x28
    pub r14: u64, // 0x30
    pub r15: u64, // 0x38
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Initialize a fresh fiber context.
///
/// Sets up the frame so that the first switch into it enters the trampoline
/// with `entry_fn`/`entry_arg` staged in r12/r13.
///
/// # Safety
///
/// `ctx` must point to valid Context memory and `stack_top` must be the
/// high end of a live stack mapping.
#[inline]
pub unsafe fn init_context(
    ctx: *mut Context,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    let sp = stack_top as usize;

    // 16-byte alignment per the ABI, minus 8 to mimic a call-pushed frame
    let aligned_sp = (sp & !0xF) - 8;

    let ctx = &mut *ctx;
    ctx.rsp = aligned_sp as u64;
    ctx.rip = entry_trampoline as usize as u64;
    ctx.rbx = 0;
    ctx.rbp = 0;
    ctx.r12 = entry_fn as u64;
    ctx.r13 = entry_arg as u64;
    ctx.r14 = 0;
    ctx.r15 = 0;
}

/// First-entry trampoline: calls `entry_fn(entry_arg)`.
///
/// The entry function terminates the fiber by switching away and never
/// returns; falling through to `ud2` means a terminated fiber was resumed.
#[unsafe(naked)]
unsafe extern "C" fn entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Voluntary context switch: saves callee-saved registers into `save`,
/// loads `load`, and jumps to its resume address.
///
/// # Safety
///
/// Both pointers must reference valid Context memory; `load` must have been
/// filled by `init_context` or by a previous save.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save callee-saved registers into save (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load callee-saved registers from load (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Jump to the resume address
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
