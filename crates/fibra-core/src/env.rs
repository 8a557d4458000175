//! Environment variable utilities
//!
//! Small parsing helpers shared by the config and logging layers.

use std::str::FromStr;

/// Get environment variable parsed as type T, or return the default
///
/// Works with any type that implements `FromStr`; parse failures fall
/// back to the default.
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

/// Get environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" (case-insensitive) as true;
/// everything else set is false, unset returns the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Check if environment variable is set (regardless of value)
#[inline]
pub fn env_is_set(key: &str) -> bool {
    std::env::var(key).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_returns_default() {
        let val: usize = env_get("__FIBRA_TEST_UNSET__", 17);
        assert_eq!(val, 17);
        assert!(env_get_bool("__FIBRA_TEST_UNSET__", true));
        let opt: Option<u16> = env_get_opt("__FIBRA_TEST_UNSET__");
        assert!(opt.is_none());
        assert!(!env_is_set("__FIBRA_TEST_UNSET__"));
    }

    #[test]
    fn test_parse_failure_returns_default() {
        std::env::set_var("__FIBRA_TEST_BAD__", "not_a_number");
        let val: usize = env_get("__FIBRA_TEST_BAD__", 5);
        assert_eq!(val, 5);
        std::env::remove_var("__FIBRA_TEST_BAD__");
    }

    #[test]
    fn test_bool_variants() {
        for s in ["1", "true", "YES", "on"] {
            std::env::set_var("__FIBRA_TEST_BOOL__", s);
            assert!(env_get_bool("__FIBRA_TEST_BOOL__", false), "{}", s);
        }
        std::env::set_var("__FIBRA_TEST_BOOL__", "0");
        assert!(!env_get_bool("__FIBRA_TEST_BOOL__", true));
        std::env::remove_var("__FIBRA_TEST_BOOL__");
    }
}
