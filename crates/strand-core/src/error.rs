//! Error types for the fiber runtime

use core::fmt;

/// Result type for runtime operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler/reactor operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// A hooked call exceeded its timeout
    Timeout,

    /// Scheduler used before start / after stop
    NotRunning,

    /// Component initialized twice
    AlreadyInitialized,

    /// Operation not valid in the current fiber/scheduler state
    InvalidState(&'static str),

    /// Stack allocation or protection failed
    Memory(MemoryError),

    /// An OS call failed; carries errno
    Os(i32),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::Timeout => write!(f, "operation timed out"),
            SchedError::NotRunning => write!(f, "scheduler not running"),
            SchedError::AlreadyInitialized => write!(f, "already initialized"),
            SchedError::InvalidState(what) => write!(f, "invalid state: {}", what),
            SchedError::Memory(e) => write!(f, "memory error: {}", e),
            SchedError::Os(errno) => write!(f, "os error: errno {}", errno),
        }
    }
}

impl std::error::Error for SchedError {}

/// Fiber-stack memory errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// mprotect on the guard page failed
    ProtectionFailed,

    /// Requested stack size out of range
    BadSize(usize),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "stack allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "guard page protection failed"),
            MemoryError::BadSize(sz) => write!(f, "bad stack size: {}", sz),
        }
    }
}

impl From<MemoryError> for SchedError {
    fn from(e: MemoryError) -> Self {
        SchedError::Memory(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", SchedError::Timeout), "operation timed out");
        assert_eq!(
            format!("{}", SchedError::Memory(MemoryError::AllocationFailed)),
            "memory error: stack allocation failed"
        );
        assert_eq!(format!("{}", SchedError::Os(9)), "os error: errno 9");
    }

    #[test]
    fn test_memory_conversion() {
        let e: SchedError = MemoryError::BadSize(7).into();
        assert_eq!(e, SchedError::Memory(MemoryError::BadSize(7)));
    }
}
