//! Environment variable helpers
//!
//! All runtime tunables are plain env vars with typed defaults:
//!
//! ```ignore
//! let stack: usize = env_get("STRAND_STACK_SIZE", 128 * 1024);
//! let flush = env_get_bool("STRAND_LOG_FLUSH", false);
//! ```

use std::str::FromStr;

/// Parse an environment variable as `T`, falling back to `default` when the
/// variable is unset or fails to parse.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Boolean env var: "1", "true", "yes", "on" (case-insensitive) are true;
/// any other set value is false; unset returns `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_returns_default() {
        let v: usize = env_get("__STRAND_TEST_UNSET__", 17);
        assert_eq!(v, 17);
        assert!(env_get_bool("__STRAND_TEST_UNSET__", true));
        assert!(!env_get_bool("__STRAND_TEST_UNSET__", false));
    }

    #[test]
    fn test_parse_failure_returns_default() {
        std::env::set_var("__STRAND_TEST_GARBAGE__", "not-a-number");
        let v: u64 = env_get("__STRAND_TEST_GARBAGE__", 3);
        assert_eq!(v, 3);
        std::env::remove_var("__STRAND_TEST_GARBAGE__");
    }

    #[test]
    fn test_bool_variants() {
        std::env::set_var("__STRAND_TEST_BOOL__", "YES");
        assert!(env_get_bool("__STRAND_TEST_BOOL__", false));
        std::env::set_var("__STRAND_TEST_BOOL__", "0");
        assert!(!env_get_bool("__STRAND_TEST_BOOL__", true));
        std::env::remove_var("__STRAND_TEST_BOOL__");
    }
}
