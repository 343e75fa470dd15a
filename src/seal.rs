//! Point-to-point confidentiality for request/response bodies.
//!
//! Relaying peers see every envelope on the broadcast topic, so bodies are
//! sealed for the target peer only: X25519 Diffie-Hellman over the montgomery
//! form of the ed25519 identity keys, with the raw shared secret used directly
//! as a ChaCha20-Poly1305 key. A fresh random nonce is prefixed to each
//! ciphertext. Empty input short-circuits to a no-op so callers can treat
//! "no body" uniformly.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

/// ChaCha20-Poly1305 nonce size in bytes.
pub const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SealError {
    #[error("unsupported key type: not a valid identity-curve key")]
    UnsupportedKeyType,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
}

/// Derive the X25519 shared secret between our identity key and a peer's.
///
/// Both sides of an exchange derive the same secret:
/// `dh(a, B) == dh(b, A)` for identity keys `(a, A)` and `(b, B)`.
fn shared_secret(
    secret: &iroh::SecretKey,
    peer: &iroh::PublicKey,
) -> Result<[u8; 32], SealError> {
    let signing = ed25519_dalek::SigningKey::from_bytes(&secret.to_bytes());
    let scalar = x25519_dalek::StaticSecret::from(signing.to_scalar_bytes());

    let verifying = ed25519_dalek::VerifyingKey::from_bytes(peer.as_bytes())
        .map_err(|_| SealError::UnsupportedKeyType)?;
    let peer_x = x25519_dalek::PublicKey::from(verifying.to_montgomery().to_bytes());

    Ok(scalar.diffie_hellman(&peer_x).to_bytes())
}

/// Encrypt `plaintext` for `peer`. Output is `nonce || ciphertext+tag`.
/// Empty plaintext is returned unchanged.
pub fn seal(
    secret: &iroh::SecretKey,
    peer: &iroh::PublicKey,
    plaintext: &[u8],
) -> Result<Vec<u8>, SealError> {
    if plaintext.is_empty() {
        return Ok(Vec::new());
    }
    let key = shared_secret(secret, peer)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::fill(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| SealError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a `nonce || ciphertext+tag` blob sealed by `peer` for us.
/// Empty ciphertext is returned unchanged.
pub fn unseal(
    secret: &iroh::SecretKey,
    peer: &iroh::PublicKey,
    ciphertext: &[u8],
) -> Result<Vec<u8>, SealError> {
    if ciphertext.is_empty() {
        return Ok(Vec::new());
    }
    if ciphertext.len() < NONCE_LEN {
        return Err(SealError::DecryptionFailed);
    }
    let key = shared_secret(secret, peer)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

    let (nonce_bytes, payload) = ciphertext.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), payload)
        .map_err(|_| SealError::DecryptionFailed)
}
