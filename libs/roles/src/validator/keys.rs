//! ed25519 keys and signatures.
//! This is just an adapter of ed25519_dalek, exposing the API that the
//! consensus messages need.
use super::Hash;
use anyhow::Context as _;
use ed::{Signer as _, Verifier as _};
use ed25519_dalek as ed;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of a validator, derived from its public key.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, core::hash::Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr:{}", hex::encode(self.0))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

/// ed25519 secret key.
#[derive(Clone)]
pub struct SecretKey(ed::SigningKey);

impl SecretKey {
    /// Generates a secret key from the given source of entropy.
    pub fn generate(rng: &mut impl rand::Rng) -> Self {
        Self(ed::SigningKey::from_bytes(&rng.gen()))
    }

    /// Signs a message.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.0.sign(msg))
    }

    /// Computes the public key for this secret key.
    pub fn public(&self) -> PublicKey {
        PublicKey(ed::VerifyingKey::from(&self.0))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log the key material.
        write!(f, "SecretKey({:?})", self.public())
    }
}

/// ed25519 public key.
#[derive(Clone)]
pub struct PublicKey(ed::VerifyingKey);

impl PublicKey {
    /// Verifies a signature of a message against this public key.
    pub fn verify(&self, msg: &[u8], sig: &Signature) -> Result<(), InvalidSignatureError> {
        self.0
            .verify(msg, &sig.0)
            .map_err(|_| InvalidSignatureError)
    }

    /// The validator address for this key: the first 20 bytes of the
    /// sha256 digest of the raw key.
    pub fn address(&self) -> Address {
        let digest = Hash::sha256(self.0.as_bytes());
        let mut addr = [0; 20];
        addr.copy_from_slice(&digest.0[..20]);
        Address(addr)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Decodes a key from raw bytes.
    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let bytes: &[u8; 32] = bytes.try_into().context("invalid key length")?;
        ed::VerifyingKey::from_bytes(bytes)
            .context("invalid key material")
            .map(Self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ed25519:{}", hex::encode(self.0.as_bytes()))
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(self.0.as_bytes());
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for PublicKey {}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.0.as_bytes().serialize(s)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes = <[u8; 32]>::deserialize(d)?;
        ed::VerifyingKey::from_bytes(&bytes)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// ed25519 signature.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(ed::Signature);

impl Signature {
    /// Raw signature bytes.
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }

    /// Decodes a signature from raw bytes.
    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let bytes: &[u8; 64] = bytes.try_into().context("invalid signature length")?;
        Ok(Self(ed::Signature::from_bytes(bytes)))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sig:{}", hex::encode(&self.0.to_bytes()[..6]))
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.0.to_bytes().to_vec().serialize(s)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(d)?;
        Signature::decode(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Error returned when an invalid signature is detected.
#[derive(Debug, thiserror::Error)]
#[error("invalid signature")]
pub struct InvalidSignatureError;
