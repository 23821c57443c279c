//! Environment variable utilities
//!
//! Small `FromStr`-based helpers used by the runtime configuration.

use std::str::FromStr;

/// Get an environment variable parsed as `T`, or the default.
///
/// Unset or unparseable values both fall back to the default.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Get an environment variable parsed as `T`, if set and parseable.
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

/// Boolean helper: "1", "true", "yes", "on" (case-insensitive) are true.
/// Any other set value is false; unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_returns_default() {
        let v: usize = env_get("__NETLOOP_TEST_UNSET__", 17);
        assert_eq!(v, 17);
        assert!(env_get_opt::<u64>("__NETLOOP_TEST_UNSET__").is_none());
        assert!(env_get_bool("__NETLOOP_TEST_UNSET__", true));
    }

    #[test]
    fn test_set_and_parse() {
        std::env::set_var("__NETLOOP_TEST_NUM__", "42");
        let v: u32 = env_get("__NETLOOP_TEST_NUM__", 0);
        assert_eq!(v, 42);
        std::env::remove_var("__NETLOOP_TEST_NUM__");
    }

    #[test]
    fn test_parse_failure_returns_default() {
        std::env::set_var("__NETLOOP_TEST_BAD__", "not-a-number");
        let v: u32 = env_get("__NETLOOP_TEST_BAD__", 9);
        assert_eq!(v, 9);
        std::env::remove_var("__NETLOOP_TEST_BAD__");
    }

    #[test]
    fn test_bool_variants() {
        for s in ["1", "true", "YES", "on"] {
            std::env::set_var("__NETLOOP_TEST_BOOL__", s);
            assert!(env_get_bool("__NETLOOP_TEST_BOOL__", false), "{}", s);
        }
        std::env::set_var("__NETLOOP_TEST_BOOL__", "0");
        assert!(!env_get_bool("__NETLOOP_TEST_BOOL__", true));
        std::env::remove_var("__NETLOOP_TEST_BOOL__");
    }
}
