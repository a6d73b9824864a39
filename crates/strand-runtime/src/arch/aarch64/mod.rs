//! aarch64 context switching implementation
//!
//! TODO: port the voluntary switch (x19-x28, fp, lr, sp, d8-d15 per AAPCS64)

/// Callee-saved frame for AArch64 (x19-x28, fp, lr, sp, d8-d15).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Context {
    pub regs: [u64; 21],
}

impl Context {
    pub const fn zeroed() -> Self {
        Self { regs: [0; 21] }
    }
}

/// Initialize a fresh fiber context.
///
/// # Safety
///
/// `ctx` must point to valid Context memory; `stack_top` must be the high
/// end of a live stack mapping.
pub unsafe fn init_context(
    _ctx: *mut Context,
    _stack_top: *mut u8,
    _entry_fn: usize,
    _entry_arg: usize,
) {
    todo!("aarch64 init_context not yet implemented")
}

/// Voluntary context switch.
///
/// # Safety
///
/// Both pointers must reference valid Context memory.
pub unsafe extern "C" fn context_switch(_save: *mut Context, _load: *const Context) {
    todo!("aarch64 context_switch not yet implemented")
}
