//! # strand - stackful fiber runtime
//!
//! Lightweight cooperative fibers multiplexed over a small pool of OS
//! threads, with a timer/epoll reactor and a hook layer that makes code
//! written in straight-line blocking style non-blocking under the hood.
//!
//! ## Quick Start
//!
//! ```ignore
//! use strand::{hook, IoManager};
//!
//! fn main() {
//!     let iom = IoManager::new(2, false, "demo");
//!
//!     iom.spawn(|| {
//!         // Runs on a fiber: this sleep parks the fiber, not the thread.
//!         hook::sleep_ms(100);
//!         println!("tick");
//!     });
//!
//!     iom.spawn(|| {
//!         let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
//!         // hook::connect / hook::read / hook::write look blocking but
//!         // yield to other fibers whenever the kernel says EAGAIN.
//!         let _ = fd;
//!     });
//!
//!     iom.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                      User Code                         │
//! │      spawn(), hook::read/write/connect/sleep, ...      │
//! └────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌────────────────────────────────────────────────────────┐
//! │                      Scheduler                         │
//! │     task queue scan, worker pool, idle-fiber switch    │
//! └────────────────────────────────────────────────────────┘
//!          │                 │                  │
//!          ▼                 ▼                  ▼
//!    ┌──────────┐      ┌──────────┐      ┌─────────────┐
//!    │  Worker  │      │  Worker  │      │  IoManager  │
//!    │  thread  │      │  thread  │      │ epoll+timer │
//!    └──────────┘      └──────────┘      └─────────────┘
//!          │                 │                  │
//!          └─────────────────┴──────────────────┘
//!                      context switches
//! ```

pub use strand_core::error::{SchedError, SchedResult};
pub use strand_core::log::{set_log_level, LogLevel};
pub use strand_core::state::FiberState;
pub use strand_core::{log_debug, log_error, log_info, log_trace, log_warn};

pub use strand_runtime::config::{self, RuntimeConfig};
pub use strand_runtime::fd_manager::{fd_manager, FdCtx, FdManager, TimeoutKind};
pub use strand_runtime::fiber::Fiber;
pub use strand_runtime::hook;
pub use strand_runtime::io_manager::{IoEvent, IoManager};
pub use strand_runtime::scheduler::{Scheduler, SchedulerGuard, Task};
pub use strand_runtime::thread::{self, Thread};
pub use strand_runtime::timer::{now_ms, Timer, TimerManager};
