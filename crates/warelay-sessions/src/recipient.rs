//! Recipient addressing for the messaging client.

use warelay_core::error::RelayError;

/// Server suffix identifying an individual contact.
pub const CONTACT_SUFFIX: &str = "@c.us";

/// Normalize a caller-supplied recipient into a chat id.
///
/// Bare numbers get [`CONTACT_SUFFIX`] appended; anything already carrying
/// a server part (`@c.us`, `@g.us`, ...) is passed through unchanged.
pub fn normalize_recipient(number: &str) -> Result<String, RelayError> {
    let trimmed = number.trim();
    if trimmed.is_empty() {
        return Err(RelayError::BadRequest("Number and message required".into()));
    }
    if trimmed.contains('@') {
        return Ok(trimmed.to_string());
    }
    let user = trimmed.strip_prefix('+').unwrap_or(trimmed);
    Ok(format!("{user}{CONTACT_SUFFIX}"))
}
