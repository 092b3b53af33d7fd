//! Token-based authentication.
//!
//! Tokens are validated against SHA-256 hashes stored in configuration.
//! Each hash may carry a set of permissions granted to callers that present
//! the matching token; the dispatcher checks method permission tags against
//! that set.

use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};

/// Permissions held by an authenticated caller.
pub type Permissions = BTreeSet<String>;

/// Validates bearer tokens against pre-configured hashes.
#[derive(Debug, Clone, Default)]
pub struct TokenValidator {
    /// Token hash (SHA-256 hex) to granted permissions.
    grants: HashMap<String, Permissions>,
}

impl TokenValidator {
    /// Creates a new validator with the given token hashes and no
    /// permissions.
    pub fn new(hashes: impl IntoIterator<Item = String>) -> Self {
        Self {
            grants: hashes
                .into_iter()
                .map(|h| (h.to_lowercase(), Permissions::new()))
                .collect(),
        }
    }

    /// Grants permissions to a token hash, registering it if needed.
    pub fn grant<I, S>(&mut self, hash: &str, permissions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants
            .entry(hash.to_lowercase())
            .or_default()
            .extend(permissions.into_iter().map(Into::into));
    }

    /// Parses a secrets line: `hash` or `hash:perm,perm`.
    ///
    /// Blank lines and `#` comments yield `None`.
    pub fn parse_line(line: &str) -> Option<(String, Vec<String>)> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (hash, perms) = line.split_once(':').unwrap_or((line, ""));
        let perms = perms
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        Some((hash.trim().to_string(), perms))
    }

    /// Returns whether any tokens are configured.
    pub fn has_tokens(&self) -> bool {
        !self.grants.is_empty()
    }

    /// Returns the number of configured tokens.
    pub fn token_count(&self) -> usize {
        self.grants.len()
    }

    /// Validates a plaintext token by hashing and comparing.
    pub fn validate(&self, token: &str) -> bool {
        self.authenticate(token).is_some()
    }

    /// Validates a token and returns the permissions it carries.
    pub fn authenticate(&self, token: &str) -> Option<Permissions> {
        if self.grants.is_empty() {
            return None;
        }
        self.grants.get(&Self::hash_token(token)).cloned()
    }

    /// Hashes a token using SHA-256, returning a lowercase hex string.
    pub fn hash_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }
}
