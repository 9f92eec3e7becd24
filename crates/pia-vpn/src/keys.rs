//! WireGuard Key Management
//!
//! X25519 keys for the tunnel, plus the [`KeyGenerator`] capability that
//! produces them either in-process or through the external `wg` tool.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

/// WireGuard private key (Curve25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: StaticSecret,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self::from_bytes)
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            key: X25519Public::from(&self.secret),
        }
    }

    /// Get raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey([redacted])")
    }
}

/// WireGuard public key (Curve25519)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: X25519Public,
}

impl PublicKey {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key: X25519Public::from(bytes),
        }
    }

    /// Create from base64 string
    pub fn from_base64(s: &str) -> Result<Self, KeyError> {
        decode_key(s).map(Self::from_bytes)
    }

    /// Get raw bytes
    pub fn to_bytes(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.to_bytes())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", &self.to_base64()[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

fn decode_key(s: &str) -> Result<[u8; 32], KeyError> {
    let bytes = BASE64.decode(s.trim()).map_err(|_| KeyError::InvalidBase64)?;

    if bytes.len() != 32 {
        return Err(KeyError::InvalidLength);
    }

    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

// Persisted as the base64 text the `wg` tool itself uses.

impl Serialize for PrivateKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// A key pair (private + public)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    pub private: PrivateKey,
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_private(PrivateKey::generate())
    }

    /// Create from a private key
    pub fn from_private(private: PrivateKey) -> Self {
        let public = private.public_key();
        Self { private, public }
    }

    /// Generate through a [`KeyGenerator`]: one call for the private key,
    /// a second deriving the public key from it
    pub async fn generate_with<G: KeyGenerator>(generator: &G) -> Result<Self, KeyError> {
        let private = generator.generate_private().await?;
        let public = generator.derive_public(&private).await?;
        Ok(Self { private, public })
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish()
    }
}

/// Source of tunnel key pairs
pub trait KeyGenerator: Send + Sync {
    fn generate_private(&self) -> impl Future<Output = Result<PrivateKey, KeyError>> + Send;

    fn derive_public(
        &self,
        private: &PrivateKey,
    ) -> impl Future<Output = Result<PublicKey, KeyError>> + Send;
}

/// In-process X25519 key generation
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeKeyGenerator;

impl KeyGenerator for NativeKeyGenerator {
    async fn generate_private(&self) -> Result<PrivateKey, KeyError> {
        Ok(PrivateKey::generate())
    }

    async fn derive_public(&self, private: &PrivateKey) -> Result<PublicKey, KeyError> {
        Ok(private.public_key())
    }
}

/// Key generation through `wg genkey` / `wg pubkey`
#[derive(Debug, Clone)]
pub struct WgToolKeyGenerator {
    binary: PathBuf,
}

impl WgToolKeyGenerator {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn tool_error(&self, step: &str, detail: impl fmt::Display) -> KeyError {
        KeyError::ToolFailed(format!("{} {}: {}", self.binary.display(), step, detail))
    }

    fn parse_output(&self, step: &str, output: std::process::Output) -> Result<String, KeyError> {
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.tool_error(step, format!("{}; {}", output.status, stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for WgToolKeyGenerator {
    fn default() -> Self {
        Self::new("wg")
    }
}

impl KeyGenerator for WgToolKeyGenerator {
    async fn generate_private(&self) -> Result<PrivateKey, KeyError> {
        debug!("Generating private key with {}", self.binary.display());
        let output = Command::new(&self.binary)
            .arg("genkey")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.tool_error("genkey", e))?;

        PrivateKey::from_base64(&self.parse_output("genkey", output)?)
    }

    async fn derive_public(&self, private: &PrivateKey) -> Result<PublicKey, KeyError> {
        let mut child = Command::new(&self.binary)
            .arg("pubkey")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.tool_error("pubkey", e))?;

        if let Some(mut stdin) = child.stdin.take() {
            let line = format!("{}\n", private.to_base64());
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| self.tool_error("pubkey", e))?;
            // stdin dropped here so the tool sees EOF
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.tool_error("pubkey", e))?;

        PublicKey::from_base64(&self.parse_output("pubkey", output)?)
    }
}

/// Key parsing and generation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid base64 encoding")]
    InvalidBase64,

    #[error("Invalid key length (expected 32 bytes)")]
    InvalidLength,

    #[error("Key tool failed: {0}")]
    ToolFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let keypair = KeyPair::generate();

        assert_eq!(keypair.private.to_bytes().len(), 32);
        assert_eq!(keypair.public, keypair.private.public_key());
    }

    #[test]
    fn test_key_base64_roundtrip() {
        let keypair = KeyPair::generate();

        let b64 = keypair.private.to_base64();
        let restored = PrivateKey::from_base64(&b64).unwrap();

        assert_eq!(keypair.private, restored);
    }

    #[test]
    fn test_tool_output_with_newline() {
        let key = PrivateKey::generate();
        let restored = PrivateKey::from_base64(&format!("{}\n", key.to_base64())).unwrap();
        assert_eq!(key, restored);
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(
            PublicKey::from_base64("not-valid-base64!!!"),
            Err(KeyError::InvalidBase64)
        ));
        assert!(matches!(
            PublicKey::from_base64("AAAA"),
            Err(KeyError::InvalidLength)
        ));
    }

    #[test]
    fn test_private_key_debug_is_redacted() {
        let key = PrivateKey::generate();
        let debug = format!("{:?}", KeyPair::from_private(key.clone()));
        assert!(!debug.contains(&key.to_base64()));
    }

    #[test]
    fn test_keypair_serde() {
        let keypair = KeyPair::generate();
        let json = serde_json::to_string(&keypair).unwrap();
        assert!(json.contains(&keypair.public.to_base64()));

        let restored: KeyPair = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, keypair);
    }

    #[tokio::test]
    async fn test_native_generator() {
        let keypair = KeyPair::generate_with(&NativeKeyGenerator).await.unwrap();
        assert_eq!(keypair.public, keypair.private.public_key());
    }

    #[tokio::test]
    async fn test_missing_tool() {
        let generator = WgToolKeyGenerator::new("/nonexistent/wg-tool");
        let result = KeyPair::generate_with(&generator).await;
        assert!(matches!(result, Err(KeyError::ToolFailed(_))));
    }
}
