//! NATS-style subject wildcard matching.
//!
//! `*` matches exactly one token; `>` matches one or more trailing tokens
//! and is only valid as the final token of a pattern. Neither wildcard
//! matches zero tokens. Patterns without wildcards are literal matches.

/// Returns whether `subject` matches `pattern`.
///
/// Deterministic and independent of anything but the two strings — no
/// handler count or registration order affects the result.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let pattern_tokens: Vec<&str> = pattern.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();
    matches_tokens(&pattern_tokens, &subject_tokens)
}

fn matches_tokens(pattern: &[&str], subject: &[&str]) -> bool {
    match pattern.first() {
        None => subject.is_empty(),
        Some(&">") => {
            // Only valid as the final token; matches one or more trailing
            // tokens, so at least one subject token must remain.
            pattern.len() == 1 && !subject.is_empty()
        }
        Some(&"*") => {
            if subject.is_empty() {
                return false;
            }
            matches_tokens(&pattern[1..], &subject[1..])
        }
        Some(head) => {
            if subject.first() != Some(head) {
                return false;
            }
            matches_tokens(&pattern[1..], &subject[1..])
        }
    }
}

/// Validate that a subscription/access pattern uses `>` only as the final
/// token.
pub fn is_valid_pattern(pattern: &str) -> bool {
    let tokens: Vec<&str> = pattern.split('.').collect();
    if tokens.iter().any(|t| t.is_empty()) {
        return false;
    }
    for (i, token) in tokens.iter().enumerate() {
        if *token == ">" && i != tokens.len() - 1 {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_match() {
        assert!(matches("relay.agent.alice", "relay.agent.alice"));
        assert!(!matches("relay.agent.alice", "relay.agent.bob"));
    }

    #[test]
    fn single_token_wildcard() {
        assert!(matches("relay.agent.*", "relay.agent.alice"));
        assert!(!matches("relay.agent.*", "relay.agent.alice.bob"));
    }

    #[test]
    fn star_never_matches_zero_tokens() {
        assert!(!matches("relay.agent.*", "relay.agent"));
    }

    #[test]
    fn tail_wildcard_matches_one_or_more() {
        assert!(matches("relay.agent.>", "relay.agent.alice"));
        assert!(matches("relay.agent.>", "relay.agent.alice.bob"));
        assert!(!matches("relay.agent.>", "relay.agent"));
    }

    #[test]
    fn relay_tail_matches_any_subject_with_one_more_token() {
        assert!(matches("relay.>", "relay.agent"));
        assert!(matches("relay.>", "relay.agent.alice.bob"));
        assert!(!matches("relay.>", "relay"));
    }

    #[test]
    fn tail_wildcard_only_valid_as_final_token() {
        assert!(is_valid_pattern("relay.agent.>"));
        assert!(!is_valid_pattern("relay.>.agent"));
    }

    #[test]
    fn empty_tokens_invalid() {
        assert!(!is_valid_pattern("relay..agent"));
    }

    #[test]
    fn matching_is_deterministic() {
        for _ in 0..50 {
            assert!(matches("relay.agent.*", "relay.agent.alice"));
        }
    }

    proptest::proptest! {
        #[test]
        fn literal_patterns_only_match_themselves(
            a in "[a-z]{1,5}(\\.[a-z]{1,5}){0,4}",
            b in "[a-z]{1,5}(\\.[a-z]{1,5}){0,4}",
        ) {
            if a == b {
                prop_assert!(matches(&a, &b));
            } else {
                prop_assert_eq!(matches(&a, &b), false);
            }
        }
    }
}
