use std::path::{Component, Path};

use crate::TransferError;

/// Longest identifier accepted for clients and sessions.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Validates that an identifier can be embedded in a sink file name.
///
/// Client ids are caller-supplied and end up in `{client}_{session}` file
/// names inside the downloads directory, so they must form a single plain
/// path component.
///
/// Rejects:
/// - Empty or overlong ids
/// - Path separators (`/`, `\`) and drive prefixes (`:`)
/// - `.` and `..`
/// - Control characters
pub fn validate_identifier(id: &str) -> Result<(), TransferError> {
    if id.is_empty() {
        return Err(TransferError::InvalidIdentifier("empty identifier".into()));
    }

    if id.len() > MAX_IDENTIFIER_LEN {
        return Err(TransferError::InvalidIdentifier(format!(
            "identifier longer than {MAX_IDENTIFIER_LEN} bytes"
        )));
    }

    if let Some(c) = id
        .chars()
        .find(|c| c.is_control() || matches!(c, '/' | '\\' | ':'))
    {
        return Err(TransferError::InvalidIdentifier(format!(
            "character {c:?} not allowed: {id}"
        )));
    }

    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(TransferError::InvalidIdentifier(format!(
            "not a plain name: {id}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty() {
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn rejects_parent_dir() {
        assert!(validate_identifier("..").is_err());
        assert!(validate_identifier(".").is_err());
    }

    #[test]
    fn rejects_separators() {
        assert!(validate_identifier("../../etc/passwd").is_err());
        assert!(validate_identifier("a/b").is_err());
        assert!(validate_identifier("a\\b").is_err());
        assert!(validate_identifier("C:evil").is_err());
    }

    #[test]
    fn rejects_control_characters() {
        assert!(validate_identifier("line\nbreak").is_err());
        assert!(validate_identifier("nul\0").is_err());
    }

    #[test]
    fn rejects_overlong() {
        let id = "x".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(matches!(
            validate_identifier(&id),
            Err(TransferError::InvalidIdentifier(_))
        ));
        assert!(validate_identifier(&"x".repeat(MAX_IDENTIFIER_LEN)).is_ok());
    }

    #[test]
    fn accepts_typical_ids() {
        assert!(validate_identifier("restaurant-1").is_ok());
        assert!(validate_identifier("9f1c2e4a-7b7e-4d1f-9a57-0d3c8e2b6a11").is_ok());
        assert!(validate_identifier("1718000000000-a1b2c3d4").is_ok());
        assert!(validate_identifier("store.eu_west").is_ok());
    }
}
