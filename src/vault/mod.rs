mod crypto;

use std::fmt;

use base64::Engine;
use zeroize::Zeroize;

use crate::config::Config;
use crate::vault::crypto::{
    open_xchacha20poly1305, random_key_32, seal_xchacha20poly1305, sha256_hex,
};

/// Prefix carried by every encrypted value, in config and in secrets files.
pub const ENCRYPTED_PREFIX: &str = "secure://";

const VALUE_AAD: &[u8] = b"aifabrix:secure:v1";

#[derive(thiserror::Error, Debug)]
pub enum VaultError {
    #[error("failed to decrypt value ({0}); the encryption key may have changed, re-authenticate or run login again")]
    Decryption(String),
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),
}

/// 32 bytes of symmetric key material, zeroized on drop.
#[derive(Clone)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn generate() -> Self {
        Self(random_key_32())
    }

    /// Accepts base64 of 32 bytes or 64 hex characters.
    pub fn parse(raw: &str) -> Result<Self, VaultError> {
        parse_key_32(raw).map(Self).map_err(VaultError::InvalidKey)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short, non-reversible identifier for display.
    pub fn fingerprint(&self) -> String {
        sha256_hex(&self.0)[..12].to_string()
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey({})", self.fingerprint())
    }
}

/// Result of [`TokenVault::encrypt`].
///
/// Encryption never fails the caller; a degraded result is reported as
/// `PlaintextFallback` so call sites can log it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptOutcome {
    Encrypted(String),
    /// No key configured, or the value already carries the marker.
    Passthrough(String),
    PlaintextFallback { value: String, reason: String },
}

impl EncryptOutcome {
    pub fn into_value(self) -> String {
        match self {
            EncryptOutcome::Encrypted(v) | EncryptOutcome::Passthrough(v) => v,
            EncryptOutcome::PlaintextFallback { value, .. } => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, EncryptOutcome::PlaintextFallback { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct TokenVault {
    key: Option<EncryptionKey>,
}

impl TokenVault {
    pub fn new(key: Option<EncryptionKey>) -> Self {
        Self { key }
    }

    /// Build from the `secrets-encryption` entry of a loaded config.
    pub fn from_config(config: &Config) -> Result<Self, VaultError> {
        let key = match config.secrets_encryption.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(EncryptionKey::parse(raw)?),
            _ => None,
        };
        Ok(Self { key })
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    pub fn key_fingerprint(&self) -> Option<String> {
        self.key.as_ref().map(EncryptionKey::fingerprint)
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENCRYPTED_PREFIX)
    }

    pub fn encrypt(&self, value: &str) -> EncryptOutcome {
        let Some(key) = self.key.as_ref() else {
            return EncryptOutcome::Passthrough(value.to_string());
        };
        if Self::is_encrypted(value) {
            return EncryptOutcome::Passthrough(value.to_string());
        }
        match seal_xchacha20poly1305(&key.0, value.as_bytes(), VALUE_AAD) {
            Ok(sealed) => EncryptOutcome::Encrypted(format!(
                "{}{}",
                ENCRYPTED_PREFIX,
                base64::engine::general_purpose::STANDARD.encode(sealed)
            )),
            Err(reason) => EncryptOutcome::PlaintextFallback {
                value: value.to_string(),
                reason,
            },
        }
    }

    /// Encrypt, logging when the value had to stay in plaintext.
    pub fn encrypt_or_warn(&self, value: &str, what: &str) -> String {
        let outcome = self.encrypt(value);
        if let EncryptOutcome::PlaintextFallback { reason, .. } = &outcome {
            tracing::warn!(%what, %reason, "encryption failed; storing value in plaintext");
        }
        outcome.into_value()
    }

    pub fn decrypt(&self, value: &str) -> Result<String, VaultError> {
        let Some(key) = self.key.as_ref() else {
            return Ok(value.to_string());
        };
        let Some(encoded) = value.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(value.to_string());
        };
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim().as_bytes())
            .map_err(|_| VaultError::Decryption("ciphertext is not valid base64".to_string()))?;
        let plain = open_xchacha20poly1305(&key.0, &sealed, VALUE_AAD)
            .map_err(VaultError::Decryption)?;
        String::from_utf8(plain)
            .map_err(|_| VaultError::Decryption("plaintext is not valid utf-8".to_string()))
    }
}

fn parse_key_32(raw: &str) -> Result<[u8; 32], String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("missing key".to_string());
    }

    // Hex (64 chars) first: a 64-char hex string is also valid base64 but decodes to 48 bytes.
    if trimmed.len() == 64 {
        if let Ok(decoded) = hex::decode(trimmed) {
            let mut out = [0u8; 32];
            out.copy_from_slice(&decoded);
            return Ok(out);
        }
    }

    if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(trimmed.as_bytes()) {
        if decoded.len() == 32 {
            let mut out = [0u8; 32];
            out.copy_from_slice(&decoded);
            return Ok(out);
        }
    }

    Err("expected base64 or 64-char hex for 32 bytes".to_string())
}
