//! URL validation and filename derivation for downloaded model assets.

use crate::error::CoreError;

/// Validate that a download URL is non-empty and uses `http(s)`.
pub fn validate_download_url(url: &str) -> Result<(), CoreError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(CoreError::Validation(
            "Download URL must not be empty".to_string(),
        ));
    }
    if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
        return Err(CoreError::Validation(format!(
            "Download URL must start with http:// or https://, got: '{trimmed}'"
        )));
    }
    Ok(())
}

/// Derive the cache filename for a URL from the last segment of its path.
///
/// Query strings and fragments are ignored. URLs whose path has no usable
/// segment, or whose last segment would escape the cache directory, are
/// rejected.
pub fn filename_from_url(url: &str) -> Result<String, CoreError> {
    validate_download_url(url)?;

    let clean = url.trim();
    let clean = clean.split('#').next().unwrap_or(clean);
    let clean = clean.split('?').next().unwrap_or(clean);

    let rest = clean
        .strip_prefix("https://")
        .or_else(|| clean.strip_prefix("http://"))
        .unwrap_or(clean);
    let path = rest.find('/').map(|i| &rest[i..]).unwrap_or("");

    match path.rsplit('/').find(|s| !s.is_empty()) {
        Some(".") | Some("..") | None => Err(CoreError::Validation(format!(
            "Cannot derive a filename from URL '{clean}'"
        ))),
        Some(name) if name.contains('\\') => Err(CoreError::Validation(format!(
            "Filename derived from URL contains a path separator: '{name}'"
        ))),
        Some(name) => Ok(name.to_string()),
    }
}
