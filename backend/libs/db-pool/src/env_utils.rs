//! Environment variable parsing utilities
//!
//! Unlike a silent `unwrap_or(default)`, a variable that is present but does
//! not parse is reported as an error so a typo in deployment config fails
//! startup instead of quietly running with the default.

use std::str::FromStr;

/// Parse an environment variable, falling back to `default` when it is unset or empty
///
/// # Example
/// ```ignore
/// let port: u16 = parse_env_or("HEALTH_PORT", 8080)?;
/// ```
pub fn parse_env_or<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    Ok(parse_env_optional(key)?.unwrap_or(default))
}

/// Parse an environment variable, returning `Ok(None)` when it is unset or empty
pub fn parse_env_optional<T: FromStr>(key: &str) -> Result<Option<T>, String> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| format!("Failed to parse environment variable {}={:?}", key, raw)),
        _ => Ok(None),
    }
}

/// Parse a required environment variable
pub fn parse_env_required<T: FromStr>(key: &str) -> Result<T, String> {
    parse_env_optional(key)?.ok_or_else(|| format!("Environment variable {} not set", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_parse_env_or_default_when_unset() {
        std::env::remove_var("DB_POOL_TEST_VALUE");
        assert_eq!(parse_env_or("DB_POOL_TEST_VALUE", 7u32), Ok(7));
    }

    #[test]
    #[serial]
    fn test_parse_env_or_reads_value() {
        std::env::set_var("DB_POOL_TEST_VALUE", " 42 ");
        assert_eq!(parse_env_or("DB_POOL_TEST_VALUE", 7u32), Ok(42));
        std::env::remove_var("DB_POOL_TEST_VALUE");
    }

    #[test]
    #[serial]
    fn test_parse_env_or_rejects_garbage() {
        std::env::set_var("DB_POOL_TEST_VALUE", "forty-two");
        let err = parse_env_or("DB_POOL_TEST_VALUE", 7u32).unwrap_err();
        assert!(err.contains("DB_POOL_TEST_VALUE"));
        std::env::remove_var("DB_POOL_TEST_VALUE");
    }

    #[test]
    #[serial]
    fn test_parse_env_required() {
        std::env::remove_var("DB_POOL_TEST_VALUE");
        assert!(parse_env_required::<String>("DB_POOL_TEST_VALUE").is_err());

        std::env::set_var("DB_POOL_TEST_VALUE", "");
        assert!(parse_env_required::<String>("DB_POOL_TEST_VALUE").is_err());

        std::env::set_var("DB_POOL_TEST_VALUE", "postgres://localhost/logs");
        assert_eq!(
            parse_env_required::<String>("DB_POOL_TEST_VALUE").unwrap(),
            "postgres://localhost/logs"
        );
        std::env::remove_var("DB_POOL_TEST_VALUE");
    }
}
