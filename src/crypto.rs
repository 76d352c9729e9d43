//! Session keypair handling and the opaque asymmetric operations used by
//! the login handshake.
//!
//! The bus consumes these as black boxes: encrypt-to-public-key,
//! decrypt-with-private-key, hash. Authentication payloads are always
//! sealed to the bus key before transmission; nothing here ever puts a
//! password or challenge on the wire in the clear.

use rand_core::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

use crate::remote::EncryptedAuth;

/// RSA modulus size for generated session keypairs.
pub const SESSION_KEY_BITS: usize = 2048;

/// Error type for key operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid key format: {0}")]
    InvalidFormat(String),

    #[error("Cryptographic operation failed: {0}")]
    CryptoError(String),

    #[error("Failed to read key file: {0}")]
    Io(#[from] std::io::Error),
}

/// A session's asymmetric keypair.
///
/// Generated fresh unless the `access.key` option points at an existing
/// PKCS#8 private key. The private half never leaves this type.
pub struct SessionKeyPair {
    private: Box<RsaPrivateKey>,
    public_der: Vec<u8>,
}

impl SessionKeyPair {
    /// Generate a fresh keypair.
    pub fn generate() -> Result<Self, KeyError> {
        Self::generate_with_bits(SESSION_KEY_BITS)
    }

    /// Generate a keypair with an explicit modulus size. Sizes below
    /// [`SESSION_KEY_BITS`] are for tests and constrained targets only.
    pub fn generate_with_bits(bits: usize) -> Result<Self, KeyError> {
        let private =
            RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| KeyError::CryptoError(e.to_string()))?;
        Self::from_private(private)
    }

    /// Load from a PKCS#8 PEM string, checking the PEM tag first.
    pub fn from_pkcs8_pem(pem_content: &str) -> Result<Self, KeyError> {
        let parsed =
            pem::parse(pem_content.as_bytes()).map_err(|e| KeyError::InvalidFormat(e.to_string()))?;

        if parsed.tag() != "PRIVATE KEY" {
            return Err(KeyError::InvalidFormat(format!(
                "Expected PRIVATE KEY, got {}",
                parsed.tag()
            )));
        }

        let private = RsaPrivateKey::from_pkcs8_der(parsed.contents())
            .map_err(|e| KeyError::InvalidFormat(e.to_string()))?;
        Self::from_private(private)
    }

    /// Load from a PKCS#8 PEM file on disk.
    pub fn from_pkcs8_pem_file(path: impl AsRef<Path>) -> Result<Self, KeyError> {
        let pem_content = std::fs::read_to_string(path)?;
        Self::from_pkcs8_pem(&pem_content)
    }

    fn from_private(private: RsaPrivateKey) -> Result<Self, KeyError> {
        let public_der = RsaPublicKey::from(&private)
            .to_public_key_der()
            .map_err(|e| KeyError::CryptoError(e.to_string()))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            private: Box::new(private),
            public_der,
        })
    }

    /// DER-encoded public half, as sent to the bus during login.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_der
    }

    /// Decrypt a payload encrypted to this keypair's public half.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyError> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|e| KeyError::CryptoError(e.to_string()))
    }
}

impl fmt::Debug for SessionKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeyPair([REDACTED])")
    }
}

/// Encrypt a payload to a DER-encoded RSA public key.
pub fn encrypt_to(public_key_der: &[u8], data: &[u8]) -> Result<Vec<u8>, KeyError> {
    let public = RsaPublicKey::from_public_key_der(public_key_der)
        .map_err(|e| KeyError::InvalidFormat(e.to_string()))?;
    public
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, data)
        .map_err(|e| KeyError::CryptoError(e.to_string()))
}

/// Build the sealed authentication payload for a login handshake.
///
/// The blob binds the authenticating keypair to the secret:
/// `SHA256(session public key) || SHA256(secret)`, encrypted to the bus
/// public key. Fixed-size, so it always fits one RSA block.
pub fn seal_auth(
    bus_public_key_der: &[u8],
    session_public_key_der: &[u8],
    secret: &[u8],
) -> Result<EncryptedAuth, KeyError> {
    let mut blob = Vec::with_capacity(64);
    blob.extend_from_slice(&Sha256::digest(session_public_key_der));
    blob.extend_from_slice(&Sha256::digest(secret));
    let payload = encrypt_to(bus_public_key_der, &blob)?;
    Ok(EncryptedAuth { payload })
}
