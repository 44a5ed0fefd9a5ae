//! Member identities, signatures and content digests.
//!
//! Members are identified by their Ed25519 verification key. Digests are
//! produced by the hash algorithm selected in configuration.

use crate::error::{ConsensusError, Result};
use ed25519_consensus::{SigningKey, VerificationKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

/// A committee member identity (Ed25519 verification key bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId([u8; 32]);

impl MemberId {
    /// The length of a member id in bytes.
    pub const LEN: usize = 32;

    /// Creates a member id from raw key bytes.
    ///
    /// The bytes are not checked to be a valid curve point; use
    /// [`MemberId::from_hex`] for untrusted input.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parses a hex-encoded verification key.
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| ConsensusError::InvalidKey(e.to_string()))?;
        VerificationKey::try_from(bytes)
            .map_err(|e| ConsensusError::InvalidKey(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Returns the hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns a short identifier (first 4 bytes as hex), for logs.
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Verifies `signature` over `message` against this key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        let key = VerificationKey::try_from(self.0)
            .map_err(|_| ConsensusError::BadSignature(*self))?;
        let sig = ed25519_consensus::Signature::from(signature.0);
        key.verify(&sig, message)
            .map_err(|_| ConsensusError::BadSignature(*self))
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({})", self.short_id())
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_id())
    }
}

impl FromStr for MemberId {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for MemberId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MemberId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// An Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// The length of a signature in bytes.
    pub const LEN: usize = 64;

    /// Creates a signature from raw bytes.
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 64];
        hex::decode_to_slice(&s, &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// The node's signing identity.
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generates a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::new(OsRng),
        }
    }

    /// Derives a deterministic keypair from a seed. Only meant for devnets
    /// and tests.
    pub fn from_seed(seed: u64) -> Self {
        let secret: [u8; 32] = Sha256::digest(seed.to_be_bytes()).into();
        Self {
            signing_key: SigningKey::from(secret),
        }
    }

    /// Creates a keypair from a hex-encoded 32-byte secret.
    pub fn from_secret_hex(s: &str) -> Result<Self> {
        let mut secret = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut secret)
            .map_err(|e| ConsensusError::InvalidKey(e.to_string()))?;
        Ok(Self {
            signing_key: SigningKey::from(secret),
        })
    }

    /// Hex-encoded secret, as accepted by [`Keypair::from_secret_hex`].
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.as_bytes())
    }

    /// Returns the member id for this keypair.
    pub fn member_id(&self) -> MemberId {
        MemberId(self.signing_key.verification_key().to_bytes())
    }

    /// Signs a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.signing_key.sign(message).to_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("member", &self.member_id())
            .finish_non_exhaustive()
    }
}

/// A content hash produced by a [`HashAlgorithm`].
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Digest(Vec<u8>);

impl Digest {
    /// Wraps raw hash bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.len().min(8);
        write!(f, "Digest({})", hex::encode(&self.0[..end]))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// Hash function used for content digests and signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256 (32-byte digests).
    #[default]
    Sha256,
    /// SHA-512 (64-byte digests).
    Sha512,
}

impl HashAlgorithm {
    /// Output length in bytes.
    pub const fn output_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Hashes `data`.
    pub fn digest(self, data: &[u8]) -> Digest {
        match self {
            HashAlgorithm::Sha256 => Digest(Sha256::digest(data).to_vec()),
            HashAlgorithm::Sha512 => Digest(Sha512::digest(data).to_vec()),
        }
    }

    /// The all-zero digest that genesis payloads chain from.
    pub fn genesis(self) -> Digest {
        Digest(vec![0u8; self.output_len()])
    }
}

impl FromStr for HashAlgorithm {
    type Err = ConsensusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            "sha512" | "sha-512" => Ok(HashAlgorithm::Sha512),
            other => Err(ConsensusError::Config(format!(
                "unknown hash algorithm: {other}"
            ))),
        }
    }
}
