use rand::RngCore;
use std::fmt;

use super::cipher::CipherError;

/// Length in bytes of the AES-256 key.
pub const KEY_LEN: usize = 32;

/// Key material for the stream cipher.
///
/// Debug output is redacted; use [`EncryptionKey::to_hex`] to export the key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Produces fresh random key bytes.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parses a key from its 64-character hex form.
    pub fn from_hex(encoded: &str) -> Result<Self, CipherError> {
        let raw = hex::decode(encoded.trim())
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        let bytes: [u8; KEY_LEN] = raw.try_into().map_err(|raw: Vec<u8>| {
            CipherError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, raw.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Generates a random owner ID for nodes started without one.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
