//! Architecture-specific context switching
//!
//! A fiber's saved machine state is the callee-saved register set plus the
//! stack pointer and resume address. Switching is always voluntary, so
//! caller-saved registers need no preservation.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{context_switch, init_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{context_switch, init_context, Context};
    } else {
        compile_error!("Unsupported architecture");
    }
}
