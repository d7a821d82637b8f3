//! Signing and verification primitives for receipts.
//!
//! Receipts are signed with Ed25519 over the raw SHA-256 digest of the
//! canonical body. The signer is a capability: the receipt builder only needs
//! `key_id()` and `sign_ed25519()`, so deployments can back it with an HSM or
//! KMS without touching the builder. [`LocalSigner`] is the file/seed-backed
//! implementation used by the gateway and by tests.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// Size of an Ed25519 seed / secret key in bytes.
pub const SEED_SIZE: usize = 32;

/// Size of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Errors that can occur during key loading and storage.
#[derive(Debug, Error)]
pub enum KeyError {
    /// I/O error during key file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Key file has the wrong length or encoding.
    #[error("invalid key format: {path}")]
    InvalidKeyFormat {
        /// The offending key file.
        path: String,
    },

    /// Key file is readable by group or other.
    #[error("insecure permissions on key file: {path}")]
    InsecurePermissions {
        /// The path with insecure permissions.
        path: String,
    },
}

/// Capability for signing receipt digests.
///
/// Implementations must be deterministic for a given message: Ed25519 is,
/// and anything replacing it must be too, because receipts are content
/// addressed before they are signed.
pub trait Signer: Send + Sync {
    /// Returns the identifier recorded in receipts and the signing-key table.
    fn key_id(&self) -> &str;

    /// Signs a message (the raw digest bytes, not the prefixed string).
    fn sign_ed25519(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE];

    /// Returns the public key bytes for ledger storage.
    fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE];
}

/// In-process Ed25519 signer.
pub struct LocalSigner {
    key_id: String,
    signing_key: SigningKey,
}

impl LocalSigner {
    /// Creates a signer from a raw 32-byte seed.
    #[must_use]
    pub fn from_seed(key_id: impl Into<String>, seed: &[u8; SEED_SIZE]) -> Self {
        Self {
            key_id: key_id.into(),
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Generates a signer from OS randomness.
    #[must_use]
    pub fn generate(key_id: impl Into<String>) -> Self {
        let mut seed = Zeroizing::new([0u8; SEED_SIZE]);
        rand::rngs::OsRng.fill_bytes(&mut seed[..]);
        Self::from_seed(key_id, &seed)
    }

    /// Loads the seed from `path`, or generates one and stores it there with
    /// 0600 permissions.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the file exists but has the wrong length or is
    /// readable by group/other, or on I/O failure.
    pub fn load_or_generate(key_id: impl Into<String>, path: &Path) -> Result<Self, KeyError> {
        if path.exists() {
            let metadata = std::fs::metadata(path)?;
            if metadata.permissions().mode() & 0o077 != 0 {
                return Err(KeyError::InsecurePermissions {
                    path: path.display().to_string(),
                });
            }

            let mut seed = Zeroizing::new([0u8; SEED_SIZE]);
            let mut file = OpenOptions::new().read(true).open(path)?;
            let n = file.read(&mut seed[..])?;
            if n != SEED_SIZE || file.read(&mut [0u8; 1])? != 0 {
                return Err(KeyError::InvalidKeyFormat {
                    path: path.display().to_string(),
                });
            }
            return Ok(Self::from_seed(key_id, &seed));
        }

        let signer = Self::generate(key_id);
        let seed = Zeroizing::new(signer.signing_key.to_bytes());
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)?;
        file.write_all(&seed[..])?;
        Ok(signer)
    }
}

impl Signer for LocalSigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn sign_ed25519(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }

    fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.signing_key.verifying_key().to_bytes()
    }
}

/// Errors from signature verification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// The public key bytes do not decode to a valid Ed25519 point.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// The signature bytes have the wrong length.
    #[error("invalid signature encoding")]
    InvalidSignature,

    /// The signature does not verify over the message.
    #[error("signature verification failed")]
    VerificationFailed,
}

/// Verifies an Ed25519 signature over a message.
///
/// # Errors
///
/// Returns [`SignatureError`] if the key or signature is malformed, or if
/// verification fails.
pub fn verify_signature(
    public_key: &[u8; PUBLIC_KEY_SIZE],
    message: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;
    let signature = ed25519_dalek::Signature::from_slice(signature)
        .map_err(|_| SignatureError::InvalidSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let signer = LocalSigner::generate("test-key");
        let message = b"digest bytes";
        let sig = signer.sign_ed25519(message);
        verify_signature(&signer.public_key_bytes(), message, &sig).unwrap();
    }

    #[test]
    fn flipped_signature_bit_fails() {
        let signer = LocalSigner::generate("test-key");
        let message = b"digest bytes";
        let mut sig = signer.sign_ed25519(message);
        sig[0] ^= 0x01;
        assert_eq!(
            verify_signature(&signer.public_key_bytes(), message, &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn wrong_length_signature_rejected() {
        let signer = LocalSigner::generate("test-key");
        assert_eq!(
            verify_signature(&signer.public_key_bytes(), b"m", &[0u8; 63]),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn seed_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signing.key");

        let first = LocalSigner::load_or_generate("relia-dev", &path).unwrap();
        let second = LocalSigner::load_or_generate("relia-dev", &path).unwrap();
        assert_eq!(first.public_key_bytes(), second.public_key_bytes());

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn world_readable_key_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signing.key");
        LocalSigner::load_or_generate("relia-dev", &path).unwrap();

        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o644);
        std::fs::set_permissions(&path, perms).unwrap();

        let result = LocalSigner::load_or_generate("relia-dev", &path);
        assert!(matches!(
            result,
            Err(KeyError::InsecurePermissions { .. })
        ));
    }
}
