//! Environment variable loading utilities
//!
//! Common patterns for loading environment variables with type conversion
//! and fallback defaults, all under a consistent `RUNBRIDGE_` prefix.

use std::env;
use std::str::FromStr;

/// Load an environment variable with a string default
pub fn load_env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Load an environment variable with type conversion and default
pub fn load_env_parsed<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Load an environment variable as an Option<T>
pub fn load_env_optional<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Builder for loading multiple environment variables with a consistent prefix
#[derive(Debug)]
pub struct EnvLoader {
    prefix: String,
}

impl EnvLoader {
    /// Create a new environment loader with the given prefix
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Load a string value with default
    pub fn load_string(&self, suffix: &str, default: &str) -> String {
        let key = format!("{}_{}", self.prefix, suffix);
        load_env_string(&key, default)
    }

    /// Load a parsed value with default
    pub fn load_parsed<T>(&self, suffix: &str, default: T) -> T
    where
        T: FromStr,
    {
        let key = format!("{}_{}", self.prefix, suffix);
        load_env_parsed(&key, default)
    }

    /// Load an optional value
    pub fn load_optional<T>(&self, suffix: &str) -> Option<T>
    where
        T: FromStr,
    {
        let key = format!("{}_{}", self.prefix, suffix);
        load_env_optional(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_env_string_default() {
        let value = load_env_string("RUNBRIDGE_TEST_DOES_NOT_EXIST", "fallback");
        assert_eq!(value, "fallback");
    }

    #[test]
    fn test_load_env_parsed_default() {
        let value: u64 = load_env_parsed("RUNBRIDGE_TEST_DOES_NOT_EXIST", 42);
        assert_eq!(value, 42);
    }

    #[test]
    fn test_env_loader_prefix() {
        std::env::set_var("RUNBRIDGE_TEST_LOADER_VALUE", "7");
        let loader = EnvLoader::new("RUNBRIDGE_TEST_LOADER");
        let value: u32 = loader.load_parsed("VALUE", 0);
        assert_eq!(value, 7);
        std::env::remove_var("RUNBRIDGE_TEST_LOADER_VALUE");
    }

    #[test]
    fn test_load_env_optional_missing() {
        let value: Option<u32> = load_env_optional("RUNBRIDGE_TEST_DOES_NOT_EXIST");
        assert!(value.is_none());
    }
}
