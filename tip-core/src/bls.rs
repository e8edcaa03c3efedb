//! BLS signatures on BN254: G2 public keys, G1 signatures.
//!
//! Public keys serialize uncompressed to 128 bytes and render as
//! base58-check strings with version byte `b'T'`. Signatures serialize
//! uncompressed to 64 bytes. Message hashing onto G1 uses
//! try-and-increment over counter-prefixed SHA3-256 digests; the BN254 G1
//! cofactor is one, so any curve point is in the prime-order group.

use std::fmt;

use ark_bn254::{Bn254, Fq, Fr, G1Affine, G2Affine};
use ark_ec::{AffineRepr, CurveGroup, pairing::Pairing};
use ark_ff::{BigInteger, PrimeField, UniformRand};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use rand::{CryptoRng, Rng};
use sha3::{Digest, Sha3_256};

/// Version byte of base58-check encoded public keys.
pub const KEY_VERSION: u8 = b'T';
/// Uncompressed G2 public key size in bytes.
pub const PUBLIC_KEY_SIZE: usize = 128;
/// Uncompressed G1 signature size in bytes.
pub const SIGNATURE_SIZE: usize = 64;
/// Big-endian scalar size in bytes.
pub const SCALAR_SIZE: usize = 32;

/// Domain tag for hashing messages onto G1.
const HASH_TO_G1_TAG: &[u8] = b"TIP:BN254G1";

/// Errors returned by the cryptographic primitives.
///
/// Invariants that are statically guaranteed (AES key length, serializing
/// a valid point) are not represented here; violating them is a programmer
/// error and panics.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// A scalar could not be parsed from its hex form.
    #[error("invalid scalar encoding")]
    InvalidScalar,
    /// A public key could not be parsed from bytes or base58-check.
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    /// A signature failed to parse or to verify.
    #[error("invalid signature")]
    InvalidSignature,
    /// Hybrid decryption failed (truncated ciphertext or GCM tag mismatch).
    #[error("decryption failed")]
    DecryptFailed,
    /// Threshold recovery had too few agreeing partials or produced a
    /// signature that does not verify against the group commitment.
    #[error("threshold recovery failed")]
    RecoverFailed,
}

/// A long-term private key: a BN254 scalar.
#[derive(Clone)]
pub struct SecretKey(Fr);

/// A public key: a point on BN254 G2.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(pub(crate) G2Affine);

/// A BLS signature: a point on BN254 G1.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Signature(pub(crate) G1Affine);

impl SecretKey {
    /// Samples a fresh key.
    pub fn random<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        Self(Fr::rand(rng))
    }

    /// Parses a key from hex bytes, reduced modulo the group order.
    /// Accepts any byte length, matching the lenient scalar parsing of the
    /// wire formats.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidScalar)?;
        Ok(Self(Fr::from_be_bytes_mod_order(&bytes)))
    }

    /// Hex form of the 32-byte big-endian scalar.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// The 32-byte big-endian scalar.
    pub fn to_bytes(&self) -> [u8; SCALAR_SIZE] {
        scalar_to_bytes(&self.0)
    }

    /// The associated G2 public key.
    pub fn public(&self) -> PublicKey {
        PublicKey((G2Affine::generator() * self.0).into_affine())
    }

    /// Signs a message: `H(msg)·d` on G1.
    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature((hash_to_g1(msg) * self.0).into_affine())
    }

    pub(crate) fn scalar(&self) -> Fr {
        self.0
    }

    pub(crate) fn from_scalar(scalar: Fr) -> Self {
        Self(scalar)
    }
}

impl PublicKey {
    /// The 128-byte uncompressed point.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let mut buf = [0u8; PUBLIC_KEY_SIZE];
        self.0
            .serialize_uncompressed(&mut buf[..])
            .expect("serializing a valid G2 point cannot fail");
        buf
    }

    /// Parses an uncompressed point, validating curve and subgroup
    /// membership.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidPublicKey);
        }
        let point = G2Affine::deserialize_uncompressed(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(point))
    }

    /// Base58-check form with version byte `b'T'`.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.to_bytes())
            .with_check_version(KEY_VERSION)
            .into_string()
    }

    /// Parses a base58-check key, rejecting wrong versions and bad
    /// checksums.
    pub fn from_base58(s: &str) -> Result<Self, CryptoError> {
        let data = bs58::decode(s)
            .with_check(Some(KEY_VERSION))
            .into_vec()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        // with_check keeps the version byte in front of the payload
        Self::from_bytes(&data[1..])
    }

    /// Verifies a BLS signature: `e(sig, G2) == e(H(msg), pk)`.
    pub fn verify(&self, msg: &[u8], sig: &Signature) -> Result<(), CryptoError> {
        let lhs = Bn254::pairing(sig.0, G2Affine::generator());
        let rhs = Bn254::pairing(hash_to_g1(msg), self.0);
        if lhs == rhs {
            Ok(())
        } else {
            Err(CryptoError::InvalidSignature)
        }
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base58())
    }
}

impl Signature {
    /// The 64-byte uncompressed point.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        let mut buf = [0u8; SIGNATURE_SIZE];
        self.0
            .serialize_uncompressed(&mut buf[..])
            .expect("serializing a valid G1 point cannot fail");
        buf
    }

    /// Parses an uncompressed G1 point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignature);
        }
        let point = G1Affine::deserialize_uncompressed(bytes)
            .map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(point))
    }

    /// Parses a hex encoded signature.
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidSignature)?;
        Self::from_bytes(&bytes)
    }

    /// Hex form of the 64-byte point.
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }
}

/// Maps a message onto G1 by try-and-increment: the counter-prefixed
/// SHA3-256 digest is reduced into the base field and used as an x
/// coordinate until one lands on the curve. The counter parity picks the
/// y sign so the map stays deterministic.
pub(crate) fn hash_to_g1(msg: &[u8]) -> G1Affine {
    for ctr in 0u32.. {
        let mut hasher = Sha3_256::new();
        hasher.update(HASH_TO_G1_TAG);
        hasher.update(ctr.to_be_bytes());
        hasher.update(msg);
        let x = Fq::from_be_bytes_mod_order(&hasher.finalize());
        if let Some(point) = G1Affine::get_point_from_x_unchecked(x, ctr & 1 == 1) {
            return point;
        }
    }
    unreachable!("half of all field elements are valid x coordinates")
}

/// Big-endian bytes of a scalar.
pub(crate) fn scalar_to_bytes(scalar: &Fr) -> [u8; SCALAR_SIZE] {
    let bytes = scalar.into_bigint().to_bytes_be();
    let mut buf = [0u8; SCALAR_SIZE];
    buf[SCALAR_SIZE - bytes.len()..].copy_from_slice(&bytes);
    buf
}

/// Parses a big-endian scalar, reduced modulo the group order.
pub(crate) fn scalar_from_bytes(bytes: &[u8]) -> Fr {
    Fr::from_be_bytes_mod_order(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let mut rng = rand::thread_rng();
        let key = SecretKey::random(&mut rng);
        let public = key.public();

        let sig = key.sign(b"tip");
        public.verify(b"tip", &sig).unwrap();
        assert!(public.verify(b"pit", &sig).is_err());

        let other = SecretKey::random(&mut rng).public();
        assert!(other.verify(b"tip", &sig).is_err());
    }

    #[test]
    fn signature_round_trip() {
        let mut rng = rand::thread_rng();
        let key = SecretKey::random(&mut rng);
        let sig = key.sign(b"round trip");
        let parsed = Signature::from_hex(&sig.to_hex()).unwrap();
        assert_eq!(sig, parsed);
        key.public().verify(b"round trip", &parsed).unwrap();
    }

    #[test]
    fn base58_round_trip() {
        let mut rng = rand::thread_rng();
        let public = SecretKey::random(&mut rng).public();
        let encoded = public.to_base58();
        assert_eq!(PublicKey::from_base58(&encoded).unwrap(), public);
    }

    #[test]
    fn base58_rejects_wrong_version() {
        let mut rng = rand::thread_rng();
        let public = SecretKey::random(&mut rng).public();
        let wrong = bs58::encode(public.to_bytes())
            .with_check_version(b'X')
            .into_string();
        assert!(PublicKey::from_base58(&wrong).is_err());
    }

    #[test]
    fn base58_rejects_corrupted_checksum() {
        let mut rng = rand::thread_rng();
        let public = SecretKey::random(&mut rng).public();
        let mut encoded = public.to_base58();
        let flipped = if encoded.ends_with('2') { '3' } else { '2' };
        encoded.pop();
        encoded.push(flipped);
        assert!(PublicKey::from_base58(&encoded).is_err());
    }

    #[test]
    fn secret_key_hex_round_trip() {
        let mut rng = rand::thread_rng();
        let key = SecretKey::random(&mut rng);
        let parsed = SecretKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key.public(), parsed.public());
    }

    #[test]
    fn hash_to_g1_is_deterministic() {
        assert_eq!(hash_to_g1(b"stable"), hash_to_g1(b"stable"));
        assert_ne!(hash_to_g1(b"a"), hash_to_g1(b"b"));
    }
}
