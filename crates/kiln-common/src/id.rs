//! Build identifiers and content digests.

use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;

use crate::error::{KilnError, KilnResult};

/// Identifier of a single build invocation.
///
/// Build IDs are 12-character lowercase hex strings. They only label log
/// lines and events; nothing is keyed on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(String);

impl BuildId {
    /// Length of a build ID.
    pub const LENGTH: usize = 12;

    /// Generate a new random build ID.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(hex::encode(&uuid.as_bytes()[..Self::LENGTH / 2]))
    }

    /// Get the build ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A content-addressable SHA-256 digest (`sha256:<hex>`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    hash: String,
}

impl Digest {
    /// Algorithm prefix used for every digest.
    pub const ALGORITHM: &'static str = "sha256";

    /// Digest of `bytes`.
    #[must_use]
    pub fn of(bytes: impl AsRef<[u8]>) -> Self {
        use sha2::Digest as _;
        Self {
            hash: hex::encode(Sha256::digest(bytes.as_ref())),
        }
    }

    /// Digest over a sequence of byte chunks, each length-prefixed so that
    /// `["ab", "c"]` and `["a", "bc"]` hash differently.
    #[must_use]
    pub fn of_parts<I, P>(parts: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        use sha2::Digest as _;
        let mut hasher = Sha256::new();
        for part in parts {
            let part = part.as_ref();
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self {
            hash: hex::encode(hasher.finalize()),
        }
    }

    /// Wrap an existing hex-encoded hash.
    ///
    /// # Errors
    ///
    /// Returns an error unless `hash` is 64 lowercase hex characters.
    pub fn from_hex(hash: impl Into<String>) -> KilnResult<Self> {
        let hash = hash.into();
        if hash.len() != 64 || !hash.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(KilnError::Serialization(format!(
                "invalid sha256 digest: {hash}"
            )));
        }
        Ok(Self { hash })
    }

    /// The hex-encoded hash without the algorithm prefix.
    #[must_use]
    pub fn hex(&self) -> &str {
        &self.hash
    }

    /// First 12 hex characters, for display.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.hash[..12]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", Self::ALGORITHM, self.hash)
    }
}

impl FromStr for Digest {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((Self::ALGORITHM, hash)) => Self::from_hex(hash),
            _ => Err(KilnError::Serialization(format!("invalid digest: {s}"))),
        }
    }
}

impl TryFrom<String> for Digest {
    type Error = KilnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_build_id() {
        let id1 = BuildId::generate();
        let id2 = BuildId::generate();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), BuildId::LENGTH);
    }

    #[test]
    fn digest_of_known_input() {
        let digest = Digest::of(b"");
        assert_eq!(
            digest.to_string(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(digest.short(), "e3b0c44298fc");
    }

    #[test]
    fn digest_parsing() {
        let text = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let digest: Digest = text.parse().unwrap();
        assert_eq!(digest, Digest::of(b""));
        assert!("md5:abc".parse::<Digest>().is_err());
        assert!("sha256:xyz".parse::<Digest>().is_err());
    }

    #[test]
    fn parts_are_length_prefixed() {
        assert_ne!(Digest::of_parts(["ab", "c"]), Digest::of_parts(["a", "bc"]));
        assert_eq!(Digest::of_parts(["ab", "c"]), Digest::of_parts(["ab", "c"]));
    }

    #[test]
    fn digest_serde_is_prefixed_string() {
        let digest = Digest::of(b"layer");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{digest}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
