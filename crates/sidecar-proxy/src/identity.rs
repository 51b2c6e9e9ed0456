//! Destination identity parsing.
//!
//! The `Destination-App-Id` header carries either `<identity>` (resolved in
//! the caller's own namespace) or `<identity>.<namespace>`.

use thiserror::Error;

/// A destination identity split into its identity and namespace parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// The header value exactly as received.
    pub original: String,
    pub namespace: String,
    pub identity: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid app id {0}")]
    Invalid(String),
}

/// Parse a raw destination identity, defaulting to `namespace` when the
/// value carries no namespace segment.
pub fn parse(namespace: &str, raw: &str) -> Result<ResolvedIdentity, IdentityError> {
    let segments: Vec<&str> = raw.split('.').collect();
    match segments.as_slice() {
        [identity] => Ok(ResolvedIdentity {
            original: raw.to_string(),
            namespace: namespace.to_string(),
            identity: (*identity).to_string(),
        }),
        [identity, target_namespace] => Ok(ResolvedIdentity {
            original: raw.to_string(),
            namespace: (*target_namespace).to_string(),
            identity: (*identity).to_string(),
        }),
        _ => Err(IdentityError::Invalid(raw.to_string())),
    }
}

impl ResolvedIdentity {
    /// True when this identity names the given `(identity, namespace)` pair.
    pub fn is(&self, identity: &str, namespace: &str) -> bool {
        self.identity == identity && self.namespace == namespace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_identity_uses_caller_namespace() {
        let id = parse("prod", "orders").unwrap();
        assert_eq!(id.identity, "orders");
        assert_eq!(id.namespace, "prod");
        assert_eq!(id.original, "orders");
    }

    #[test]
    fn test_qualified_identity_uses_own_namespace() {
        let id = parse("prod", "orders.staging").unwrap();
        assert_eq!(id.identity, "orders");
        assert_eq!(id.namespace, "staging");
        assert_eq!(id.original, "orders.staging");
    }

    #[test]
    fn test_too_many_segments_rejected() {
        let err = parse("prod", "orders.staging.extra").unwrap_err();
        assert_eq!(err, IdentityError::Invalid("orders.staging.extra".to_string()));
        assert_eq!(err.to_string(), "invalid app id orders.staging.extra");

        assert!(parse("prod", "a.b.c.d").is_err());
    }

    #[test]
    fn test_empty_segments_are_still_segments() {
        // Only the segment count matters; "orders." is two segments.
        let id = parse("prod", "orders.").unwrap();
        assert_eq!(id.identity, "orders");
        assert_eq!(id.namespace, "");

        assert!(parse("prod", "..").is_err());
    }

    #[test]
    fn test_is_matches_identity_and_namespace() {
        let id = parse("prod", "orders").unwrap();
        assert!(id.is("orders", "prod"));
        assert!(!id.is("orders", "staging"));
        assert!(!id.is("billing", "prod"));
    }
}
