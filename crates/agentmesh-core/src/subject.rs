//! Subject matching and naming.
//!
//! Subjects are dot-separated ASCII tokens. In a pattern, `*` matches exactly
//! one token and a final `>` matches one or more trailing tokens. Every
//! authorization check and every broker route goes through [`matches`] so the
//! two can never disagree about what a pattern covers.

use crate::{MeshError, MeshResult};

/// Token that matches exactly one subject token.
pub const SINGLE_WILDCARD: &str = "*";
/// Final token that matches one or more trailing subject tokens.
pub const TAIL_WILDCARD: &str = ">";

/// Returns `true` if `subject` is covered by `pattern`.
///
/// Wildcards inside `subject` (a requested subscription) must be covered by
/// a wildcard at least as broad: a requested `*` only by `*` or `>`, a
/// requested `>` only by a `>` at the same or a shallower position.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    let mut pattern_tokens = pattern.split('.').peekable();

    while let Some(p) = pattern_tokens.next() {
        if p == TAIL_WILDCARD && pattern_tokens.peek().is_none() {
            // `>` needs at least one remaining token.
            return subject_tokens.next().is_some();
        }
        match subject_tokens.next() {
            Some(s) if p == s => {}
            Some(s) if p == SINGLE_WILDCARD && s != TAIL_WILDCARD => {}
            _ => return false,
        }
    }

    subject_tokens.next().is_none()
}

/// Returns `true` if any pattern in `patterns` covers `subject`.
pub fn matches_any<S: AsRef<str>>(patterns: &[S], subject: &str) -> bool {
    patterns.iter().any(|p| matches(p.as_ref(), subject))
}

/// Checks that `subject` is well formed: non-empty tokens, wildcards only as
/// whole tokens, and `>` only in the final position.
pub fn is_valid(subject: &str) -> bool {
    if subject.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = subject.split('.').collect();
    let last = tokens.len() - 1;
    tokens.iter().enumerate().all(|(i, token)| {
        if token.is_empty() || token.chars().any(char::is_whitespace) {
            return false;
        }
        if *token == TAIL_WILDCARD {
            return i == last;
        }
        *token == SINGLE_WILDCARD || !(token.contains('*') || token.contains('>'))
    })
}

/// Returns `true` if `subject` contains a wildcard token.
pub fn has_wildcard(subject: &str) -> bool {
    subject
        .split('.')
        .any(|t| t == SINGLE_WILDCARD || t == TAIL_WILDCARD)
}

/// Returns `true` if `raw` can stand as one subject token unchanged: non-empty,
/// no separators, no wildcard characters, no whitespace.
pub fn is_valid_token(raw: &str) -> bool {
    !raw.is_empty()
        && !raw
            .chars()
            .any(|c| matches!(c, '.' | '*' | '>') || c.is_whitespace() || c.is_control())
}

/// Accept `raw` as a tenant or agent id. Ids name namespaces, so they are
/// rejected rather than rewritten: two distinct ids must never share one.
pub fn validate_identifier(kind: &str, raw: &str) -> MeshResult<()> {
    if is_valid_token(raw) {
        Ok(())
    } else {
        Err(MeshError::InvalidIdentifier(format!(
            "{kind} '{raw}' must be a single subject token"
        )))
    }
}

/// Makes an arbitrary identifier safe to embed as a single subject token.
pub fn sanitize_token(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Joins a root, a tenant and further tokens into a subject, sanitizing the
/// tenant and each token.
pub fn scoped(root: &str, tenant_id: &str, tokens: &[&str]) -> String {
    let mut subject = format!("{root}.{}", sanitize_token(tenant_id));
    for token in tokens {
        subject.push('.');
        subject.push_str(&sanitize_token(token));
    }
    subject
}

/// The namespace prefix of a tenant under `root`, e.g. `tenant.acme`.
pub fn namespace(root: &str, tenant_id: &str) -> String {
    scoped(root, tenant_id, &[])
}

/// The pattern covering everything below a tenant namespace, e.g. `tenant.acme.>`.
pub fn namespace_pattern(root: &str, tenant_id: &str) -> String {
    format!("{}.{TAIL_WILDCARD}", namespace(root, tenant_id))
}

/// Returns `true` if `subject` lies strictly below `prefix` (token aligned).
pub fn is_below(prefix: &str, subject: &str) -> bool {
    subject
        .strip_prefix(prefix)
        .is_some_and(|rest| rest.len() > 1 && rest.starts_with('.'))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_wildcard_matches_any_depth() {
        assert!(matches("tenant.T.>", "tenant.T.a"));
        assert!(matches("tenant.T.>", "tenant.T.a.b.c"));
        assert!(!matches("tenant.T.>", "tenant.T"));
        assert!(!matches("tenant.T.>", "tenant.U.a"));
    }

    #[test]
    fn test_single_wildcard_requires_same_token_count() {
        assert!(matches("tenant.T.*", "tenant.T.a"));
        assert!(!matches("tenant.T.*", "tenant.T.a.b"));
        assert!(!matches("tenant.T.*", "tenant.T"));
        assert!(matches("tenant.*.orders", "tenant.X.orders"));
        assert!(!matches("tenant.*.orders", "tenant.X.invoices"));
    }

    #[test]
    fn test_exact_match() {
        assert!(matches("presence.online", "presence.online"));
        assert!(!matches("presence.online", "presence.offline"));
        assert!(!matches("presence", "presence.online"));
    }

    #[test]
    fn test_requested_wildcards_are_literal() {
        assert!(matches("tenant.T.>", "tenant.T.>"));
        assert!(matches("tenant.T.>", "tenant.T.*"));
        assert!(!matches("tenant.T.>", ">"));
        assert!(!matches("tenant.T.>", "tenant.*.x"));
        assert!(!matches("tenant.T.*", "tenant.T.>.x"));
    }

    #[test]
    fn test_requested_tail_needs_tail_pattern() {
        assert!(!matches("X.*", "X.>"));
        assert!(!matches("X.*.>", "X.>"));
        assert!(!matches("X.a", "X.*"));
        assert!(matches("X.*", "X.*"));
        assert!(matches("X.>", "X.*.>"));
        assert!(matches("X.*.>", "X.a.>"));
    }

    #[test]
    fn test_matches_any() {
        let patterns = vec!["tenant.A.>".to_string(), "presence.*".to_string()];
        assert!(matches_any(&patterns, "presence.online"));
        assert!(matches_any(&patterns, "tenant.A.x"));
        assert!(!matches_any(&patterns, "tenant.B.x"));
    }

    #[test]
    fn test_is_valid() {
        assert!(is_valid("tenant.a.b"));
        assert!(is_valid("tenant.a.>"));
        assert!(is_valid("tenant.*.b"));
        assert!(!is_valid(""));
        assert!(!is_valid("tenant..b"));
        assert!(!is_valid("tenant.>.b"));
        assert!(!is_valid("tenant.a*.b"));
        assert!(!is_valid("tenant.a b"));
        assert!(!is_valid("tenant.a."));
    }

    #[test]
    fn test_sanitize_and_scope() {
        assert_eq!(sanitize_token("a.b*c>d e"), "a_b_c_d_e");
        assert_eq!(sanitize_token(""), "_");
        assert_eq!(scoped("agents", "acme", &["tasks", "ocr"]), "agents.acme.tasks.ocr");
        assert_eq!(scoped("agents", "ac.me", &[]), "agents.ac_me");
        assert_eq!(namespace_pattern("tenant", "T1"), "tenant.T1.>");
    }

    #[test]
    fn test_identifiers_must_be_single_tokens() {
        assert!(is_valid_token("acme-01"));
        assert!(is_valid_token("a_b"));
        assert!(!is_valid_token("a.b"));
        assert!(!is_valid_token("a*"));
        assert!(!is_valid_token(">"));
        assert!(!is_valid_token("a b"));
        assert!(!is_valid_token(""));
        assert!(validate_identifier("tenant_id", "a_b").is_ok());
        assert!(matches!(
            validate_identifier("tenant_id", "a.b"),
            Err(MeshError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_is_below() {
        assert!(is_below("tenant.T1", "tenant.T1.orders"));
        assert!(!is_below("tenant.T1", "tenant.T1"));
        assert!(!is_below("tenant.T1", "tenant.T10.orders"));
        assert!(!is_below("tenant.T1", "tenant.T1."));
    }

    #[test]
    fn test_has_wildcard() {
        assert!(has_wildcard("a.*.c"));
        assert!(has_wildcard("a.>"));
        assert!(!has_wildcard("a.b.c"));
    }
}
