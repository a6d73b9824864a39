//! # strand-runtime
//!
//! The Strand fiber runtime: stackful coroutines multiplexed over a small
//! pool of OS threads, with an epoll/timer reactor and a hook layer that
//! turns blocking-style I/O into cooperative register-interest / yield /
//! resume sequences.
//!
//! This crate provides:
//! - Context switching (architecture-specific assembly)
//! - Fiber stacks (mmap + guard page)
//! - The Fiber object and its thread-local plumbing
//! - Scheduler (task queue + worker pool + idle-fiber protocol)
//! - TimerManager and IoManager (the reactor)
//! - FdManager and the hooked blocking-call surface

pub mod arch;
pub mod config;
pub mod fd_manager;
pub mod fiber;
pub mod hook;
pub mod io_manager;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod timer;

// Re-exports
pub use config::RuntimeConfig;
pub use fd_manager::{fd_manager, FdCtx, FdManager, TimeoutKind};
pub use fiber::Fiber;
pub use io_manager::{IoEvent, IoManager};
pub use scheduler::{Scheduler, SchedulerGuard, Task};
pub use thread::Thread;
pub use timer::{Timer, TimerManager};

// Platform detection: the reactor is built on epoll + eventfd.
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        // supported
    } else {
        compile_error!("strand-runtime currently supports Linux only");
    }
}
