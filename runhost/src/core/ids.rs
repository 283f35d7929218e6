//! Instance identifiers.

use std::sync::LazyLock;

use regex::Regex;

static INSTANCE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("valid instance id regex")
});

/// Validate a caller-supplied instance id.
///
/// Ids become URL path segments and file names, so they are restricted to
/// ASCII letters, digits, `.`, `_` and `-`, starting with a letter or digit.
pub fn validate_instance_id(id: &str) -> Result<(), String> {
    if INSTANCE_ID.is_match(id) {
        return Ok(());
    }
    Err(format!(
        "invalid id = '{}' (use up to 128 ASCII letters, digits, '.', '_' or '-')",
        id
    ))
}
