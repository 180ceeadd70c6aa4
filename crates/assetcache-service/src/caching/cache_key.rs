use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

/// A content-addressed key for a cached asset.
///
/// The key remembers the identifier it was created from (usually the source URL), while
/// equality and hashing only consider its SHA-256 digest.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    source: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates a [`CacheKey`] for the given identifier.
    pub fn new(source: impl AsRef<str>) -> Self {
        let source = source.as_ref();
        let hash: [u8; 32] = Sha256::digest(source.as_bytes()).into();

        CacheKey {
            source: source.into(),
            hash,
        }
    }

    /// Returns the identifier this key was created from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        format!(
            "{:02x}/{}/{}",
            self.hash[0],
            hex::encode(&self.hash[1..4]),
            hex::encode(&self.hash[4..])
        )
    }
}

impl From<&str> for CacheKey {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

impl From<String> for CacheKey {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}
