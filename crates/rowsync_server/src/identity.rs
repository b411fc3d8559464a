//! Mapping request credentials to identities.

use crate::error::{ServerError, ServerResult};
use rowsync_core::Identity;
use std::collections::HashMap;
use std::fmt;

/// Resolves the bearer credential of a request to an identity.
///
/// `Ok(None)` means the request is anonymous. Implementations return
/// `AuthenticationFailed` for credentials they do not accept.
pub trait IdentityResolver: Send + Sync + fmt::Debug {
    /// Resolves `credential` (the bearer token, if the request carried one).
    fn resolve(&self, credential: Option<&str>) -> ServerResult<Option<Identity>>;
}

/// Resolver over a fixed token table.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentityResolver {
    tokens: HashMap<String, Identity>,
}

impl StaticIdentityResolver {
    /// Creates an empty resolver. Every request is anonymous until tokens
    /// are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a token.
    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    /// Number of known tokens.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns true if no token is known.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityResolver for StaticIdentityResolver {
    fn resolve(&self, credential: Option<&str>) -> ServerResult<Option<Identity>> {
        let Some(token) = credential else {
            return Ok(None);
        };
        self.tokens
            .get(token)
            .cloned()
            .map(Some)
            .ok_or_else(|| ServerError::AuthenticationFailed("unknown token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_unknown_and_missing_tokens() {
        let resolver = StaticIdentityResolver::new()
            .with_token("tok-a", Identity::new("A").with_email("a@example.com"));

        let who = resolver.resolve(Some("tok-a")).unwrap().unwrap();
        assert_eq!(who.id, "A");
        assert!(resolver.resolve(None).unwrap().is_none());
        assert!(matches!(
            resolver.resolve(Some("nope")),
            Err(ServerError::AuthenticationFailed(_))
        ));
        assert_eq!(resolver.len(), 1);
    }
}
