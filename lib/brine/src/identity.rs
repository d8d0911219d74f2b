use crate::crypto;
use crate::encoding::base64;
use serde::{de, Deserializer};
use serde_derive::{Deserialize, Serialize};
use std::ops::Deref;
use std::path::Path;

/// Long term Ed25519 public identity key.
#[derive(Serialize, Deserialize, Copy, Clone, Eq, PartialEq)]
pub struct PublicKey(
    #[serde(serialize_with = "base64::serialize", deserialize_with = "deserialize_public")]
    [u8; crypto::SIGN_PUBLIC_KEY_SIZE],
);

/// Long term Ed25519 secret identity key.
#[derive(Serialize, Deserialize, Clone)]
pub struct SecretKey(
    #[serde(serialize_with = "base64::serialize", deserialize_with = "deserialize_secret")]
    [u8; crypto::SIGN_SECRET_KEY_SIZE],
);

/// A long term identity key pair, persistable as TOML with base64 encoded keys.
#[derive(Serialize, Deserialize, Clone)]
pub struct Identity {
    pub public: PublicKey,
    pub secret: SecretKey,
}

#[inline]
fn deserialize_b64_array<'de, D>(deserializer: D, expected: usize) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = <String as serde::Deserialize>::deserialize(deserializer)?;
    let decoded = base64::decode(&encoded).map_err(de::Error::custom)?;

    if decoded.len() != expected {
        return Err(de::Error::custom(format!(
            "key must decode to {} bytes, got {}",
            expected,
            decoded.len()
        )));
    }

    Ok(decoded)
}

#[inline]
fn deserialize_public<'de, D>(deserializer: D) -> Result<[u8; crypto::SIGN_PUBLIC_KEY_SIZE], D::Error>
where
    D: Deserializer<'de>,
{
    let decoded = deserialize_b64_array(deserializer, crypto::SIGN_PUBLIC_KEY_SIZE)?;
    let mut key = [0u8; crypto::SIGN_PUBLIC_KEY_SIZE];
    key.copy_from_slice(&decoded);
    Ok(key)
}

#[inline]
fn deserialize_secret<'de, D>(deserializer: D) -> Result<[u8; crypto::SIGN_SECRET_KEY_SIZE], D::Error>
where
    D: Deserializer<'de>,
{
    let decoded = deserialize_b64_array(deserializer, crypto::SIGN_SECRET_KEY_SIZE)?;
    let mut key = [0u8; crypto::SIGN_SECRET_KEY_SIZE];
    key.copy_from_slice(&decoded);
    Ok(key)
}

impl PublicKey {
    pub const SIZE: usize = crypto::SIGN_PUBLIC_KEY_SIZE;

    #[inline]
    pub fn new(key: [u8; Self::SIZE]) -> PublicKey {
        PublicKey(key)
    }
}

impl Deref for PublicKey {
    type Target = [u8; PublicKey::SIZE];

    #[inline]
    fn deref(&self) -> &[u8; PublicKey::SIZE] {
        &self.0
    }
}

impl SecretKey {
    pub const SIZE: usize = crypto::SIGN_SECRET_KEY_SIZE;

    #[inline]
    pub fn new(key: [u8; Self::SIZE]) -> SecretKey {
        SecretKey(key)
    }
}

impl Deref for SecretKey {
    type Target = [u8; SecretKey::SIZE];

    #[inline]
    fn deref(&self) -> &[u8; SecretKey::SIZE] {
        &self.0
    }
}

impl Identity {
    /// Generates a fresh identity.
    #[inline]
    pub fn generate() -> Identity {
        let (secret, public) = crypto::sign_keypair();

        Identity {
            public: PublicKey(public),
            secret: SecretKey(secret),
        }
    }

    /// Signs a message with the identity's secret key.
    #[inline]
    pub fn sign(&self, message: &[u8]) -> [u8; crypto::SIGNATURE_SIZE] {
        crypto::sign(message, &self.secret.0)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Identity, serdeconv::Error> {
        serdeconv::from_toml_file(path)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), serdeconv::Error> {
        serdeconv::to_toml_file(self, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    #[test]
    fn test_sign_with_generated_identity() {
        let identity = Identity::generate();
        let signature = identity.sign(b"handshake blob");

        assert!(crypto::sign_verify(&signature, b"handshake blob", &identity.public));
        assert!(!crypto::sign_verify(&signature, b"other blob", &identity.public));
    }

    #[test]
    fn test_toml_roundtrip() {
        let identity = Identity::generate();

        let toml = serdeconv::to_toml_string(&identity).unwrap();
        let restored: Identity = serdeconv::from_toml_str(&toml).unwrap();

        assert_eq!(*restored.public, *identity.public);
        assert_eq!(&restored.secret[..], &identity.secret[..]);
    }
}
