use std::str::FromStr;

use crate::error::ConfigError;

/// Source of raw setting values, normally the process environment.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Process environment lookup.
pub(crate) fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Read an optional setting; empty values count as unset.
pub(crate) fn optional_env(lookup: Lookup<'_>, key: &str) -> Result<Option<String>, ConfigError> {
    Ok(lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
}

/// Parse an optional setting, falling back to `default` when unset.
pub(crate) fn parse_optional_env<T>(lookup: Lookup<'_>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(lookup, key)? {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{}': {}", raw, e),
        }),
        None => Ok(default),
    }
}

/// Parse an optional boolean flag; accepts `true/false`, `1/0`, `yes/no`.
pub(crate) fn parse_bool_env(lookup: Lookup<'_>, key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(lookup, key)? {
        Some(raw) => match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("must be 'true' or 'false', got '{}'", raw),
            }),
        },
        None => Ok(default),
    }
}
