//! Hybrid encryption for request payloads and DKG deal shares.
//!
//! The sender derives a 32-byte AES key as `SHA3-256(bytes(d·P))` where `d`
//! is its own scalar and `P` the recipient's G2 key, then seals the
//! plaintext with AES-256-GCM under a fresh random 12-byte nonce. The
//! ciphertext layout is `nonce(12) || ciphertext || tag(16)`. Both sides of
//! the Diffie-Hellman arrive at the same key, so decryption takes the
//! mirrored key pair.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use ark_ec::CurveGroup;
use rand::{CryptoRng, Rng};
use sha3::{Digest, Sha3_256};

use crate::bls::{CryptoError, PublicKey, SecretKey};

/// AES-GCM nonce size in bytes.
pub const NONCE_SIZE: usize = 12;
/// AES-GCM authentication tag size in bytes.
pub const TAG_SIZE: usize = 16;

/// Derives the shared AES key from one side of the key exchange.
pub fn shared_key(secret: &SecretKey, public: &PublicKey) -> [u8; 32] {
    let point = PublicKey((public.0 * secret.scalar()).into_affine());
    Sha3_256::digest(point.to_bytes()).into()
}

/// Seals `plaintext` towards `public` using the sender key `secret`.
pub fn encrypt<R: Rng + CryptoRng>(
    rng: &mut R,
    secret: &SecretKey,
    public: &PublicKey,
    plaintext: &[u8],
) -> Vec<u8> {
    let key = shared_key(secret, public);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

    let mut nonce = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .expect("AES-GCM encryption cannot fail for in-memory buffers");

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    out
}

/// Opens a ciphertext produced by [`encrypt`] on the other side of the
/// exchange. Truncated input and tag mismatches both surface as
/// [`CryptoError::DecryptFailed`].
pub fn decrypt(
    secret: &SecretKey,
    public: &PublicKey,
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::DecryptFailed);
    }
    let key = shared_key(secret, public);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| CryptoError::DecryptFailed)
}
