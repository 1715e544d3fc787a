//! Submission-time validation.
//!
//! The payload itself is opaque here (schema validation happens at the API
//! boundary); this layer only enforces the limits the orchestration core
//! depends on.

use crate::error::CoreError;

/// Default upper bound on a request payload: 1 MiB.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Maximum length of a caller-supplied idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Maximum length of an owner id.
const MAX_OWNER_ID_LEN: usize = 255;

/// Validate an owner id: non-empty, bounded, no control characters.
pub fn validate_owner_id(owner_id: &str) -> Result<(), CoreError> {
    if owner_id.trim().is_empty() {
        return Err(CoreError::Validation("Owner id must not be empty".to_string()));
    }
    if owner_id.len() > MAX_OWNER_ID_LEN {
        return Err(CoreError::Validation(format!(
            "Owner id must not exceed {MAX_OWNER_ID_LEN} characters"
        )));
    }
    if owner_id.chars().any(char::is_control) {
        return Err(CoreError::Validation(
            "Owner id must not contain control characters".to_string(),
        ));
    }
    Ok(())
}

/// Validate an idempotency key.
///
/// Rules:
/// - Must not be empty or whitespace-only.
/// - Must not exceed `MAX_IDEMPOTENCY_KEY_LEN` bytes.
/// - Printable ASCII only, so keys survive headers and logs unchanged.
pub fn validate_idempotency_key(key: &str) -> Result<(), CoreError> {
    if key.trim().is_empty() {
        return Err(CoreError::Validation(
            "Idempotency key must not be empty".to_string(),
        ));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(CoreError::Validation(format!(
            "Idempotency key must not exceed {MAX_IDEMPOTENCY_KEY_LEN} characters"
        )));
    }
    if !key.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
        return Err(CoreError::Validation(
            "Idempotency key may only contain printable ASCII characters".to_string(),
        ));
    }
    Ok(())
}

/// Validate the opaque payload: non-empty and within `max_bytes`.
pub fn validate_payload(payload: &[u8], max_bytes: usize) -> Result<(), CoreError> {
    if payload.is_empty() {
        return Err(CoreError::Validation("Request payload must not be empty".to_string()));
    }
    if payload.len() > max_bytes {
        return Err(CoreError::Validation(format!(
            "Request payload is {} bytes, limit is {max_bytes}",
            payload.len()
        )));
    }
    Ok(())
}
