//! Subject token syntax shared between envelope validation and the matcher.
//!
//! Subjects are dot-separated tokens matching `[a-z0-9-]+`; no empty
//! tokens. This module owns tokenization and validation; `relay-subject`
//! owns wildcard matching over the tokens produced here.

use crate::error::RelayError;

pub fn tokenize(subject: &str) -> Vec<&str> {
    subject.split('.').collect()
}

pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Validate a literal (non-pattern) subject: non-empty, dot-separated,
/// every token matches `[a-z0-9-]+`.
pub fn validate_subject(subject: &str) -> Result<(), RelayError> {
    if subject.is_empty() {
        return Err(RelayError::Malformed("empty subject".to_string()));
    }
    for token in tokenize(subject) {
        if !is_valid_token(token) {
            return Err(RelayError::Malformed(format!(
                "invalid subject token {token:?} in {subject:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_subject() {
        assert!(validate_subject("relay.agent.proj.backend").is_ok());
    }

    #[test]
    fn rejects_empty_token() {
        assert!(validate_subject("relay..agent").is_err());
    }

    #[test]
    fn rejects_empty_subject() {
        assert!(validate_subject("").is_err());
    }

    #[test]
    fn rejects_uppercase() {
        assert!(validate_subject("Relay.Agent").is_err());
    }

    #[test]
    fn accepts_hyphens_and_digits() {
        assert!(validate_subject("relay.agent.proj-42.backend-9").is_ok());
    }
}
