//! Threshold-BLS on G1 over the group polynomial produced by the DKG.
//!
//! Each signer holds a [`PrivateShare`], an evaluation of the group
//! polynomial at `index + 1`, and produces 66-byte [`PartialSignature`]s:
//! a 2-byte big-endian share index followed by the 64-byte G1 point. Any
//! `t` valid partials recover the group signature by Lagrange interpolation
//! at zero; the result is the deterministic BLS signature of the group
//! secret and verifies against `C_0` of the [`Commitments`].

use ark_bn254::{Fr, G1Projective, G2Projective};
use ark_ec::CurveGroup;
use ark_ff::{Field, One, Zero};
use std::collections::BTreeMap;

use crate::bls::{
    CryptoError, PUBLIC_KEY_SIZE, PublicKey, SCALAR_SIZE, SecretKey, Signature, hash_to_g1,
    scalar_from_bytes, scalar_to_bytes,
};

/// Serialized partial size: `be16(index) || signature(64)`.
pub const PARTIAL_SIZE: usize = 66;
/// Serialized private share size: `be32(index) || scalar(32)`.
pub const PRIVATE_SHARE_SIZE: usize = 4 + SCALAR_SIZE;

/// A signer's share of the group secret: the group polynomial evaluated at
/// `index + 1`.
#[derive(Clone)]
pub struct PrivateShare {
    /// Position of the owning signer in the sorted signer list.
    pub index: u32,
    scalar: Fr,
}

/// One signer's contribution to a threshold signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartialSignature {
    pub index: u32,
    pub signature: Signature,
}

/// The public commitments `{C_0, …, C_{t-1}}` of the group polynomial.
/// `C_0` is the group public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commitments(Vec<PublicKey>);

impl PrivateShare {
    pub(crate) fn new(index: u32, scalar: Fr) -> Self {
        Self { index, scalar }
    }

    /// `be32(index) || scalar`, the persisted poly-share layout.
    pub fn to_bytes(&self) -> [u8; PRIVATE_SHARE_SIZE] {
        let mut buf = [0u8; PRIVATE_SHARE_SIZE];
        buf[..4].copy_from_slice(&self.index.to_be_bytes());
        buf[4..].copy_from_slice(&scalar_to_bytes(&self.scalar));
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PRIVATE_SHARE_SIZE {
            return Err(CryptoError::InvalidScalar);
        }
        let index = u32::from_be_bytes(bytes[..4].try_into().expect("4 bytes"));
        Ok(Self {
            index,
            scalar: scalar_from_bytes(&bytes[4..]),
        })
    }

    /// Produces this signer's partial over `msg`.
    pub fn partial_sign(&self, msg: &[u8]) -> PartialSignature {
        PartialSignature {
            index: self.index,
            signature: SecretKey::from_scalar(self.scalar).sign(msg),
        }
    }
}

impl PartialSignature {
    pub fn to_bytes(&self) -> [u8; PARTIAL_SIZE] {
        let index = u16::try_from(self.index).expect("signer groups stay far below 2^16");
        let mut buf = [0u8; PARTIAL_SIZE];
        buf[..2].copy_from_slice(&index.to_be_bytes());
        buf[2..].copy_from_slice(&self.signature.to_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PARTIAL_SIZE {
            return Err(CryptoError::InvalidSignature);
        }
        let index = u16::from_be_bytes(bytes[..2].try_into().expect("2 bytes"));
        Ok(Self {
            index: u32::from(index),
            signature: Signature::from_bytes(&bytes[2..])?,
        })
    }
}

impl Commitments {
    pub fn new(points: Vec<PublicKey>) -> Self {
        assert!(!points.is_empty(), "a commitment polynomial has degree >= 0");
        Self(points)
    }

    /// The threshold `t` of the sharing, one commitment per coefficient.
    pub fn threshold(&self) -> usize {
        self.0.len()
    }

    /// The group public key `C_0`.
    pub fn public_key(&self) -> PublicKey {
        self.0[0]
    }

    pub fn points(&self) -> &[PublicKey] {
        &self.0
    }

    /// Evaluates the commitment polynomial at `index + 1`, yielding the
    /// public key matching that signer's private share.
    pub fn evaluate(&self, index: u32) -> PublicKey {
        let x = Fr::from(u64::from(index) + 1);
        let mut acc = G2Projective::zero();
        let mut power = Fr::one();
        for point in &self.0 {
            acc += point.0 * power;
            power *= x;
        }
        PublicKey(acc.into_affine())
    }

    /// Checks one partial against the commitment evaluation at its index.
    pub fn verify_partial(&self, msg: &[u8], partial: &PartialSignature) -> Result<(), CryptoError> {
        self.evaluate(partial.index).verify(msg, &partial.signature)
    }

    /// Concatenated 128-byte points, the persisted poly-public layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.0.len() * PUBLIC_KEY_SIZE);
        for point in &self.0 {
            buf.extend_from_slice(&point.to_bytes());
        }
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.is_empty() || bytes.len() % PUBLIC_KEY_SIZE != 0 {
            return Err(CryptoError::InvalidPublicKey);
        }
        let points = bytes
            .chunks_exact(PUBLIC_KEY_SIZE)
            .map(PublicKey::from_bytes)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self(points))
    }
}

/// Recovers the group signature over `msg` from partials.
///
/// Partials are verified individually against the commitments; invalid or
/// duplicate ones are discarded. Fewer than `threshold` surviving partials
/// fail with [`CryptoError::RecoverFailed`], as does a recovered signature
/// that does not verify against the group key.
pub fn recover(
    commitments: &Commitments,
    msg: &[u8],
    partials: &[PartialSignature],
    threshold: usize,
    total: usize,
) -> Result<Signature, CryptoError> {
    let mut valid = BTreeMap::new();
    for partial in partials {
        if partial.index as usize >= total || valid.contains_key(&partial.index) {
            continue;
        }
        if commitments.verify_partial(msg, partial).is_ok() {
            valid.insert(partial.index, partial.signature);
        }
    }
    if valid.len() < threshold {
        return Err(CryptoError::RecoverFailed);
    }

    let selected: Vec<(u32, Signature)> = valid.into_iter().take(threshold).collect();
    let indices: Vec<u32> = selected.iter().map(|(i, _)| *i).collect();
    let coefficients = lagrange_at_zero(&indices);

    let mut acc = G1Projective::zero();
    for ((_, sig), lambda) in selected.iter().zip(&coefficients) {
        acc += sig.0 * *lambda;
    }
    let signature = Signature(acc.into_affine());

    commitments
        .public_key()
        .verify(msg, &signature)
        .map_err(|_| CryptoError::RecoverFailed)?;
    Ok(signature)
}

/// Lagrange coefficients at zero for the evaluation points `index + 1`.
fn lagrange_at_zero(indices: &[u32]) -> Vec<Fr> {
    let xs: Vec<Fr> = indices.iter().map(|i| Fr::from(u64::from(*i) + 1)).collect();
    xs.iter()
        .map(|xi| {
            let mut num = Fr::one();
            let mut den = Fr::one();
            for xj in &xs {
                if xj != xi {
                    num *= xj;
                    den *= *xj - xi;
                }
            }
            num * den.inverse().expect("evaluation points are distinct")
        })
        .collect()
}

/// Evaluates a scalar polynomial (low to high coefficients) at `index + 1`.
pub(crate) fn evaluate_poly(coefficients: &[Fr], index: u32) -> Fr {
    let x = Fr::from(u64::from(index) + 1);
    let mut acc = Fr::zero();
    for coefficient in coefficients.iter().rev() {
        acc *= x;
        acc += coefficient;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_bn254::G2Affine;
    use ark_ec::AffineRepr;
    use ark_ff::UniformRand;

    fn test_sharing(threshold: usize, total: usize) -> (Vec<PrivateShare>, Commitments, Fr) {
        let mut rng = rand::thread_rng();
        let coefficients: Vec<Fr> = (0..threshold).map(|_| Fr::rand(&mut rng)).collect();
        let commitments = Commitments::new(
            coefficients
                .iter()
                .map(|c| PublicKey((G2Affine::generator() * *c).into_affine()))
                .collect(),
        );
        let shares = (0..total as u32)
            .map(|i| PrivateShare::new(i, evaluate_poly(&coefficients, i)))
            .collect();
        (shares, commitments, coefficients[0])
    }

    #[test]
    fn recover_matches_group_secret() {
        let (shares, commitments, secret) = test_sharing(3, 4);
        let msg = b"assignor";
        let partials: Vec<_> = shares[1..].iter().map(|s| s.partial_sign(msg)).collect();
        let sig = recover(&commitments, msg, &partials, 3, 4).unwrap();
        // threshold BLS is deterministic, recovery equals the group secret's
        // direct signature
        assert_eq!(sig, SecretKey::from_scalar(secret).sign(msg));
        commitments.public_key().verify(msg, &sig).unwrap();
    }

    #[test]
    fn recover_needs_threshold_partials() {
        let (shares, commitments, _) = test_sharing(3, 4);
        let msg = b"assignor";
        let partials: Vec<_> = shares[..2].iter().map(|s| s.partial_sign(msg)).collect();
        assert!(matches!(
            recover(&commitments, msg, &partials, 3, 4),
            Err(CryptoError::RecoverFailed)
        ));
    }

    #[test]
    fn recover_discards_bad_partials() {
        let (shares, commitments, _) = test_sharing(3, 4);
        let msg = b"assignor";
        let mut partials: Vec<_> = shares.iter().map(|s| s.partial_sign(msg)).collect();
        // one forged partial and one duplicate do not block recovery
        partials[0].signature = shares[1].partial_sign(b"other").signature;
        partials.push(partials[2]);
        let sig = recover(&commitments, msg, &partials, 3, 4).unwrap();
        commitments.public_key().verify(msg, &sig).unwrap();
    }

    #[test]
    fn partials_disagreeing_on_message_fail() {
        let (shares, commitments, _) = test_sharing(3, 4);
        let partials = vec![
            shares[0].partial_sign(b"one"),
            shares[1].partial_sign(b"two"),
            shares[2].partial_sign(b"one"),
        ];
        assert!(recover(&commitments, b"one", &partials, 3, 4).is_err());
    }

    #[test]
    fn partial_round_trip() {
        let (shares, _, _) = test_sharing(2, 3);
        let partial = shares[2].partial_sign(b"msg");
        let parsed = PartialSignature::from_bytes(&partial.to_bytes()).unwrap();
        assert_eq!(parsed, partial);
    }

    #[test]
    fn private_share_round_trip() {
        let (shares, _, _) = test_sharing(2, 3);
        let bytes = shares[1].to_bytes();
        let parsed = PrivateShare::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.index, 1);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn commitments_round_trip() {
        let (_, commitments, _) = test_sharing(3, 4);
        let parsed = Commitments::from_bytes(&commitments.to_bytes()).unwrap();
        assert_eq!(parsed, commitments);
        assert!(Commitments::from_bytes(&commitments.to_bytes()[..100]).is_err());
    }
}
