//! Name validation
//!
//! Release and resource names must be legal DNS-1123 subdomains: lowercase
//! alphanumerics and dashes, segments joined by dots, each segment starting
//! and ending with an alphanumeric, 253 characters max overall.

use crate::error::{CoreError, Result};

const MAX_NAME_LENGTH: usize = 253;

/// Validate a release name
pub fn validate_release_name(name: &str) -> Result<()> {
    validate(name, "release name")
}

/// Validate a resource name taken from `metadata.name`
pub fn validate_resource_name(name: &str) -> Result<()> {
    validate(name, "resource name")
}

fn validate(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid(name, what, "must not be empty"));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(invalid(
            name,
            what,
            &format!("must be at most {} characters", MAX_NAME_LENGTH),
        ));
    }

    for segment in name.split('.') {
        if segment.is_empty() {
            return Err(invalid(name, what, "must not contain empty dot segments"));
        }
        if !segment.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
            return Err(invalid(
                name,
                what,
                "must contain only lowercase alphanumerics, '-' and '.'",
            ));
        }
        let first = segment.chars().next().unwrap();
        let last = segment.chars().last().unwrap();
        if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
            return Err(invalid(
                name,
                what,
                "segments must start and end with an alphanumeric",
            ));
        }
    }

    Ok(())
}

fn invalid(name: &str, what: &str, reason: &str) -> CoreError {
    CoreError::InvalidName {
        name: name.to_string(),
        reason: format!("{} {}", what, reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        for name in ["webapp", "my-release", "a", "app-2", "svc.example.io"] {
            assert!(validate_release_name(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "-leading", "trailing-", "UPPER", "under_score", "dot..dot", "sp ace"] {
            assert!(validate_release_name(name).is_err(), "{} should be invalid", name);
        }
    }

    #[test]
    fn test_length_limit() {
        let long = "a".repeat(254);
        assert!(validate_resource_name(&long).is_err());
        let ok = "a".repeat(253);
        assert!(validate_resource_name(&ok).is_ok());
    }
}
