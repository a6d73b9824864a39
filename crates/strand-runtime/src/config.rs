//! Runtime configuration
//!
//! Compile-time defaults with environment-variable overrides.
//!
//! # Environment Variables
//!
//! - `STRAND_STACK_SIZE` - default fiber stack size in bytes
//! - `STRAND_CONNECT_TIMEOUT_MS` - default hooked-connect timeout
//! - `STRAND_DEBUG` - extra scheduler debug logging (0/1)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use strand_core::env::{env_get, env_get_bool};
use strand_core::error::{SchedError, SchedResult};

mod defaults {
    pub const STACK_SIZE: usize = 128 * 1024;
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;
    pub const DEBUG_LOGGING: bool = false;
}

/// Runtime tunables. `from_env` applies env overrides over defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Default stack size for fibers created with stack_size 0
    pub stack_size: usize,
    /// Default timeout for the hooked connect (u64::MAX = no timeout)
    pub connect_timeout_ms: u64,
    /// Extra scheduler debug logging
    pub debug_logging: bool,
}

impl RuntimeConfig {
    /// Library defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("STRAND_STACK_SIZE", defaults::STACK_SIZE),
            connect_timeout_ms: env_get("STRAND_CONNECT_TIMEOUT_MS", defaults::CONNECT_TIMEOUT_MS),
            debug_logging: env_get_bool("STRAND_DEBUG", defaults::DEBUG_LOGGING),
        }
    }

    /// Library defaults, no env override. For tests wanting full control.
    pub fn new() -> Self {
        Self {
            stack_size: defaults::STACK_SIZE,
            connect_timeout_ms: defaults::CONNECT_TIMEOUT_MS,
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    // Builder methods

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> SchedResult<()> {
        if self.stack_size < 16 * 1024 {
            return Err(SchedError::InvalidState("stack_size must be >= 16KB"));
        }
        if self.stack_size > 1 << 30 {
            return Err(SchedError::InvalidState("stack_size must be <= 1GB"));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Install an explicit configuration. Must run before the first fiber or
/// IoManager is created; later calls fail.
pub fn init_config(cfg: RuntimeConfig) -> SchedResult<()> {
    cfg.validate()?;
    CONFIG
        .set(cfg)
        .map_err(|_| SchedError::AlreadyInitialized)
}

/// The process-wide configuration (env-derived unless `init_config` ran).
pub fn config() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::from_env)
}

static CONNECT_TIMEOUT: OnceLock<AtomicU64> = OnceLock::new();

fn connect_timeout_cell() -> &'static AtomicU64 {
    CONNECT_TIMEOUT.get_or_init(|| AtomicU64::new(config().connect_timeout_ms))
}

/// Live value of the hooked-connect timeout (u64::MAX = no timeout).
pub fn connect_timeout_ms() -> u64 {
    connect_timeout_cell().load(Ordering::Relaxed)
}

/// Adjust the hooked-connect timeout at runtime.
pub fn set_connect_timeout_ms(ms: u64) {
    connect_timeout_cell().store(ms, Ordering::Relaxed);
}
