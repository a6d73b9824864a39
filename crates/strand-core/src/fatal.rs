//! Fatal invariant violations
//!
//! A violated scheduler invariant (resuming a running fiber, double stop,
//! stack/state mismatch at drop) implies context or stack corruption, so
//! there is nothing to recover: log with a captured backtrace and abort.

/// Log the diagnostic plus a backtrace, then abort the process.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        $crate::log_error!($($arg)*);
        $crate::log_error!("{}", std::backtrace::Backtrace::force_capture());
        std::process::abort()
    }};
}

/// Abort unless `cond` holds. Usable in both test and non-test code; unlike
/// `assert!` it is never compiled out and always captures a backtrace.
#[macro_export]
macro_rules! runtime_assert {
    ($cond:expr) => {{
        if !($cond) {
            $crate::fatal!("assertion failed: {}", stringify!($cond));
        }
    }};
    ($cond:expr, $($arg:tt)*) => {{
        if !($cond) {
            $crate::fatal!($($arg)*);
        }
    }};
}
