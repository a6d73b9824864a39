//! # strand-core
//!
//! Platform-independent core types for the Strand fiber runtime:
//!
//! - Fiber state machine ([`state::FiberState`])
//! - Error taxonomy ([`error::SchedError`])
//! - Environment variable helpers ([`env`])
//! - Leveled logging macros ([`log`])
//! - Fatal invariant-violation macros ([`fatal`])
//!
//! Nothing in this crate touches the OS; the runtime crate builds on it.

pub mod env;
pub mod error;
pub mod fatal;
pub mod log;
pub mod state;

// Re-exports
pub use error::{SchedError, SchedResult};
pub use log::{set_log_level, LogLevel};
pub use state::FiberState;
