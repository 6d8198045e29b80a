//! Crypto helpers: Ed25519 keypair handling, sign, verify, and hex
//! utilities for the scheduler's signing key and node-reported signatures.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Length of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, found {found}")]
    InvalidKeyLength { expected: usize, found: usize },

    #[error("invalid signature length: expected {SIGNATURE_LEN}, found {0}")]
    InvalidSignatureLength(usize),

    #[error("malformed public key")]
    MalformedKey,

    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Generate a fresh signing key from the OS RNG.
pub fn generate_signing_key() -> SigningKey {
    let mut rng = OsRng;
    SigningKey::generate(&mut rng)
}

/// Build a signing key from a 32-byte hex-encoded seed.
pub fn signing_key_from_hex(hexstr: &str) -> Result<SigningKey, CryptoError> {
    let bytes = hex::decode(hexstr.trim())?;
    if bytes.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: PUBLIC_KEY_LEN,
            found: bytes.len(),
        });
    }
    let mut seed = [0u8; PUBLIC_KEY_LEN];
    seed.copy_from_slice(&bytes);
    Ok(SigningKey::from_bytes(&seed))
}

/// Hex-encode a signing key's seed for on-disk storage.
pub fn signing_key_to_hex(key: &SigningKey) -> String {
    hex::encode(key.to_bytes())
}

/// Sign a message, returning the 64-byte signature.
pub fn sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    key.sign(message).to_bytes().to_vec()
}

/// Verify a message against a 32-byte public key and 64-byte signature.
///
/// Returns `Ok(false)` on a well-formed but non-verifying signature;
/// errors are reserved for malformed inputs.
pub fn verify(pubkey: &[u8], message: &[u8], sig: &[u8]) -> Result<bool, CryptoError> {
    if pubkey.len() != PUBLIC_KEY_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: PUBLIC_KEY_LEN,
            found: pubkey.len(),
        });
    }
    if sig.len() != SIGNATURE_LEN {
        return Err(CryptoError::InvalidSignatureLength(sig.len()));
    }

    let mut pk_arr = [0u8; PUBLIC_KEY_LEN];
    pk_arr.copy_from_slice(pubkey);
    let vk = VerifyingKey::from_bytes(&pk_arr).map_err(|_| CryptoError::MalformedKey)?;

    let mut sig_arr = [0u8; SIGNATURE_LEN];
    sig_arr.copy_from_slice(sig);
    Ok(vk.verify(message, &Signature::from_bytes(&sig_arr)).is_ok())
}

/// Public key bytes for a signing key.
pub fn public_key_bytes(key: &SigningKey) -> Vec<u8> {
    key.verifying_key().to_bytes().to_vec()
}
