//! Shared validation helpers

use crate::error::{ConfigError, ConfigResult};

/// Domain configs validate themselves after loading
pub trait Validatable {
    fn validate(&self) -> ConfigResult<()>;
    fn domain_name(&self) -> &'static str;
}

/// Require `value` to be one of `choices`
pub fn validate_enum_choice(
    value: &str,
    choices: &[&str],
    field: &str,
    domain: &'static str,
) -> ConfigResult<()> {
    if choices.contains(&value) {
        return Ok(());
    }
    Err(ConfigError::domain(
        domain,
        format!("{field} must be one of {choices:?}, got {value:?}"),
    ))
}

/// Require a non-empty string field
pub fn validate_non_empty(value: &str, field: &str, domain: &'static str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::domain(domain, format!("{field} must not be empty")));
    }
    Ok(())
}

/// Require an http(s) URL with a host
pub fn validate_http_url(value: &str, field: &str, domain: &'static str) -> ConfigResult<()> {
    let url = url::Url::parse(value)
        .map_err(|e| ConfigError::domain(domain, format!("{field} is not a valid URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
        return Err(ConfigError::domain(
            domain,
            format!("{field} must be an http(s) URL with a host"),
        ));
    }
    Ok(())
}
