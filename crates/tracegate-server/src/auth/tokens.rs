//! Bearer-token lookup.
//!
//! Only SHA-256 digests of tokens are kept; a presented token is hashed and
//! looked up by digest.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracegate_core::Identity;
use tracing::warn;

/// Hex SHA-256 of a bearer token.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Maps token digests to principals.
#[derive(Debug, Default, Clone)]
pub struct TokenDirectory {
    by_digest: HashMap<String, Identity>,
}

impl TokenDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a principal by token digest. A digest already in use keeps
    /// its first owner.
    pub fn insert(&mut self, digest: &str, identity: Identity) {
        let digest = digest.to_ascii_lowercase();
        if let Some(existing) = self.by_digest.get(&digest) {
            warn!(principal = %identity, existing = %existing, "token digest already registered, ignoring");
            return;
        }
        self.by_digest.insert(digest, identity);
    }

    /// Identity for a presented token, if any.
    pub fn resolve(&self, token: &str) -> Option<&Identity> {
        if token.is_empty() {
            return None;
        }
        self.by_digest.get(&hash_token(token))
    }

    /// Number of registered tokens.
    pub fn len(&self) -> usize {
        self.by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_digest.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            hash_token("test"),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn resolves_by_digest() {
        let mut dir = TokenDirectory::new();
        dir.insert(&hash_token("s3cret").to_uppercase(), Identity::new("alice"));
        assert_eq!(dir.resolve("s3cret"), Some(&Identity::new("alice")));
        assert_eq!(dir.resolve("wrong"), None);
        assert_eq!(dir.resolve(""), None);
    }

    #[test]
    fn first_registration_wins() {
        let mut dir = TokenDirectory::new();
        let digest = hash_token("shared");
        dir.insert(&digest, Identity::new("a"));
        dir.insert(&digest, Identity::new("b"));
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.resolve("shared"), Some(&Identity::new("a")));
    }
}
