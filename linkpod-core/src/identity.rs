//! Session identities: bus-assigned peer names and URL-derived link ids.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Participant identifier: the opaque unique name the bus assigns for the
/// lifetime of the session. Never reused within a session.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        PeerId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(name: &str) -> Self {
        PeerId(name.to_owned())
    }
}

/// Link identifier: lowercase hex SHA-256 of the URL. Deterministic, so two
/// peers adding the same URL independently produce the same id.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LinkId(String);

impl LinkId {
    /// Derive the id from a link URL. Always recomputed locally; ids carried
    /// on the wire are not trusted.
    pub fn from_url(url: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        LinkId(hex::encode(hasher.finalize()))
    }

    /// Wrap an identifier that arrives as plain text (e.g. handed back by
    /// the UI layer), without rederivation. Comparison against locally
    /// derived ids does the validation.
    pub fn from_text(id: impl Into<String>) -> Self {
        LinkId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
