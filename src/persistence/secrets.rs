//! Credential sealing for stored connection descriptors.
//!
//! The descriptor is opaque ciphertext at rest; plaintext exists only in
//! request scope. The actual AES-GCM implementation is an external
//! collaborator supplied at startup; the in-tree [`Base64Cipher`] is a
//! stand-in encoding with the same contract, used by development and tests.

use crate::error::{ChatDbError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Seals and opens stored connection descriptors.
pub trait CredentialCipher: Send + Sync {
    /// Seals a plaintext descriptor for storage.
    fn seal(&self, plaintext: &str) -> Result<String>;

    /// Opens a sealed descriptor back to plaintext.
    fn open(&self, sealed: &str) -> Result<String>;
}

/// Stand-in cipher: base64 transport encoding, no confidentiality.
#[derive(Debug, Default, Clone)]
pub struct Base64Cipher;

impl CredentialCipher for Base64Cipher {
    fn seal(&self, plaintext: &str) -> Result<String> {
        Ok(BASE64.encode(plaintext.as_bytes()))
    }

    fn open(&self, sealed: &str) -> Result<String> {
        let bytes = BASE64
            .decode(sealed)
            .map_err(|e| ChatDbError::persistence(format!("Failed to open credentials: {e}")))?;
        String::from_utf8(bytes)
            .map_err(|e| ChatDbError::persistence(format!("Sealed credentials not UTF-8: {e}")))
    }
}
