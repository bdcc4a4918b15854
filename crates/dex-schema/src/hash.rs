use serde::{Deserialize, Deserializer, Serialize};

/// Error returned when a digest string is not 64 hex characters.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid SHA256 digest: expected 64 hex characters in '{0}'")]
pub struct InvalidDigest(pub String);

/// A validated SHA256 digest (64 hex characters)
///
/// Validated at deserialization time so a corrupt registry can never carry an
/// unusable checksum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Create a new `Sha256Digest`, validating the input.
    ///
    /// Accepts strings with or without a `sha256:` prefix.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidDigest`] if the hex portion is not exactly 64 ASCII
    /// hex characters.
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidDigest> {
        let s = s.into();
        let hex = s.strip_prefix("sha256:").unwrap_or(&s);

        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(InvalidDigest(s));
        }

        Ok(Self(hex.to_lowercase()))
    }

    /// Get the digest as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_digest_accepts_prefix_and_uppercase() {
        let digest = Sha256Digest::new(format!("sha256:{}", EMPTY_SHA.to_uppercase())).unwrap();
        assert_eq!(digest.as_str(), EMPTY_SHA);
    }

    #[test]
    fn test_digest_rejects_bad_input() {
        assert!(Sha256Digest::new("abc").is_err());
        assert!(Sha256Digest::new("z".repeat(64)).is_err());
    }

    #[test]
    fn test_digest_deserialize_validates() {
        let ok: Result<Sha256Digest, _> = serde_json::from_str(&format!("\"{EMPTY_SHA}\""));
        assert!(ok.is_ok());
        let bad: Result<Sha256Digest, _> = serde_json::from_str("\"not-a-digest\"");
        assert!(bad.is_err());
    }
}
