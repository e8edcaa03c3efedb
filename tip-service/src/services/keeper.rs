//! The keeper guards every sign request.
//!
//! A request is admitted only after the full gauntlet: payload decryption
//! and identity binding, assignee resolution, the ephemeral replay check
//! under its rate limit, and the outer BLS signature under the secret rate
//! limit. The two buckets are penalty counters: a broken ephemeral burns
//! the large EPHEMERAL bucket, a broken signature burns the small SECRET
//! bucket that guards the value-bearing operation, and a fully valid
//! request burns neither.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tip_core::bls::PUBLIC_KEY_SIZE;
use tip_core::{PublicKey, SecretKey, Signature, hybrid};
use tip_store::{Storage, StoreError};
use tip_types::SignBody;
use tracing::instrument;

/// Floor of the ephemeral grace window.
pub const EPHEMERAL_GRACE: Duration = Duration::from_secs(128 * 24 * 60 * 60);
/// Window of the ephemeral penalty bucket.
pub const EPHEMERAL_LIMIT_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
/// Quota of the ephemeral penalty bucket.
pub const EPHEMERAL_LIMIT_QUOTA: u32 = 42;
/// Window of the secret penalty bucket.
pub const SECRET_LIMIT_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Quota of the secret penalty bucket.
pub const SECRET_LIMIT_QUOTA: u32 = 7;

const EPHEMERAL_LIMIT_TAG: &[u8] = b"EPHEMERAL";
const SECRET_LIMIT_TAG: &[u8] = b"SECRET";

/// Rejections produced by [`KeeperService::guard`].
#[derive(Debug, thiserror::Error)]
pub enum KeeperError {
    /// Base64, decryption or JSON failure on the payload.
    #[error("invalid data")]
    InvalidData,
    /// Bad base58 identity, or the plaintext identity does not match the
    /// envelope.
    #[error("invalid identity")]
    InvalidIdentity,
    /// Unparseable ephemeral, or a replayed/backwards nonce.
    #[error("invalid ephemeral")]
    InvalidEphemeral,
    /// Bad assignee format or self-signature, or the caller has been
    /// rebound to another key.
    #[error("invalid assignee")]
    InvalidAssignee,
    /// Watcher key of the wrong length, or pinned to another assignor.
    #[error("invalid watcher")]
    InvalidWatcher,
    /// The outer BLS signature failed to verify.
    #[error("invalid signature")]
    InvalidSignature,
    /// A penalty bucket is exhausted.
    #[error("too many requests")]
    TooManyRequests,
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for KeeperError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AssignorIsAssignee => KeeperError::InvalidAssignee,
            StoreError::InvalidWatcher => KeeperError::InvalidWatcher,
            other => KeeperError::Store(other),
        }
    }
}

/// The admitted request: everything the HTTP layer needs to produce the
/// partial and record the sign.
#[derive(Debug)]
pub struct Admission {
    /// Remaining secret quota after this request (a peek, the bucket is
    /// not burned by success).
    pub available: u32,
    pub nonce: u64,
    /// The caller's public key, target of the response encryption.
    pub identity: PublicKey,
    /// The effective assignor bytes, the message that gets threshold
    /// signed.
    pub assignor: Vec<u8>,
    /// The 32-byte watcher key from the plaintext.
    pub watcher: Vec<u8>,
}

/// Request validator shared by all HTTP handlers.
#[derive(Clone)]
pub struct KeeperService {
    storage: Storage,
    secret: SecretKey,
}

impl KeeperService {
    pub fn new(storage: Storage, secret: SecretKey) -> Self {
        Self { storage, secret }
    }

    /// Validates one sign request end to end.
    ///
    /// `identity` is the caller's base58-check key, `signature` the hex
    /// BLS signature over the request preimage, and `data` the base64
    /// hybrid ciphertext of the JSON body.
    #[instrument(level = "debug", skip_all, fields(identity = %identity))]
    pub fn guard(
        &self,
        identity: &str,
        signature: &str,
        data: &str,
    ) -> Result<Admission, KeeperError> {
        let ciphertext = URL_SAFE_NO_PAD
            .decode(data)
            .map_err(|_| KeeperError::InvalidData)?;
        if ciphertext.is_empty() {
            return Err(KeeperError::InvalidData);
        }
        let public = PublicKey::from_base58(identity).map_err(|_| KeeperError::InvalidIdentity)?;

        let plain = hybrid::decrypt(&self.secret, &public, &ciphertext)
            .map_err(|_| KeeperError::InvalidData)?;
        let body: SignBody =
            serde_json::from_slice(&plain).map_err(|_| KeeperError::InvalidData)?;
        if body.identity != identity {
            return Err(KeeperError::InvalidIdentity);
        }

        let assignee = if body.assignee.is_empty() {
            None
        } else {
            Some(check_assignee(&body.assignee)?)
        };
        let ephemeral = parse_hex_uint(&body.ephemeral).ok_or(KeeperError::InvalidEphemeral)?;
        // an unparseable rotation is treated as absent, matching the
        // lenient body contract
        let rotate = parse_hex_uint(&body.rotate).filter(|bytes| !bytes.is_empty());
        let signature_bytes =
            hex::decode(signature).map_err(|_| KeeperError::InvalidSignature)?;

        let identity_bytes = public.to_bytes().to_vec();
        if let Some(assignee_of_user) = self.storage.read_assignee(&identity_bytes)? {
            if assignee_of_user != identity_bytes {
                // the identity was rebound, it may no longer sign for
                // itself
                return Err(KeeperError::InvalidAssignee);
            }
        }
        let assignor = self
            .storage
            .read_assignor(&identity_bytes)?
            .unwrap_or(identity_bytes);

        let ephemeral_key = limit_key(&assignor, EPHEMERAL_LIMIT_TAG);
        let available = self.storage.check_limit(
            &ephemeral_key,
            EPHEMERAL_LIMIT_WINDOW,
            EPHEMERAL_LIMIT_QUOTA,
            false,
        )?;
        if available < 1 {
            tracing::debug!(assignor = hex::encode(&assignor), "ephemeral bucket empty");
            return Err(KeeperError::TooManyRequests);
        }

        let grace = Duration::from_nanos(body.grace).max(EPHEMERAL_GRACE);
        let valid =
            self.storage
                .check_ephemeral_nonce(&assignor, &ephemeral, body.nonce, grace)?;
        if !valid {
            let left = self.storage.check_limit(
                &ephemeral_key,
                EPHEMERAL_LIMIT_WINDOW,
                EPHEMERAL_LIMIT_QUOTA,
                true,
            )?;
            tracing::debug!(
                assignor = hex::encode(&assignor),
                left,
                "ephemeral rejected, bucket burned"
            );
            return Err(KeeperError::InvalidEphemeral);
        }
        if let Some(rotate) = &rotate {
            self.storage
                .rotate_ephemeral_nonce(&assignor, rotate, body.nonce)?;
        }

        let secret_key = limit_key(&assignor, SECRET_LIMIT_TAG);
        let available = self.storage.check_limit(
            &secret_key,
            SECRET_LIMIT_WINDOW,
            SECRET_LIMIT_QUOTA,
            false,
        )?;
        if available < 1 {
            tracing::debug!(assignor = hex::encode(&assignor), "secret bucket empty");
            return Err(KeeperError::TooManyRequests);
        }

        let grace_ns = grace.as_nanos().min(u128::from(u64::MAX)) as u64;
        let verified = check_signature(
            &public,
            &signature_bytes,
            &ephemeral,
            rotate.as_deref(),
            body.nonce,
            grace_ns,
            assignee.as_deref(),
        );
        if verified.is_err() {
            let left = self.storage.check_limit(
                &secret_key,
                SECRET_LIMIT_WINDOW,
                SECRET_LIMIT_QUOTA,
                true,
            )?;
            tracing::debug!(
                assignor = hex::encode(&assignor),
                left,
                "signature rejected, bucket burned"
            );
            return Err(KeeperError::InvalidSignature);
        }

        if let Some(assignee) = &assignee {
            self.storage
                .write_assignee(&assignor, &assignee[..PUBLIC_KEY_SIZE])?;
        }

        let watcher = hex::decode(&body.watcher).map_err(|_| KeeperError::InvalidWatcher)?;
        if watcher.len() != 32 {
            return Err(KeeperError::InvalidWatcher);
        }

        Ok(Admission {
            available,
            nonce: body.nonce,
            identity: public,
            assignor,
            watcher,
        })
    }
}

/// Rebuilds and checks the outer signature preimage:
/// `identity || ephemeral || be64(nonce) || be64(grace) || rotate? || assignee?`.
fn check_signature(
    public: &PublicKey,
    signature: &[u8],
    ephemeral: &[u8],
    rotate: Option<&[u8]>,
    nonce: u64,
    grace_ns: u64,
    assignee: Option<&[u8]>,
) -> Result<(), KeeperError> {
    let signature = Signature::from_bytes(signature).map_err(|_| KeeperError::InvalidSignature)?;
    let mut msg = public.to_bytes().to_vec();
    msg.extend_from_slice(ephemeral);
    msg.extend_from_slice(&nonce.to_be_bytes());
    msg.extend_from_slice(&grace_ns.to_be_bytes());
    if let Some(rotate) = rotate {
        msg.extend_from_slice(rotate);
    }
    if let Some(assignee) = assignee {
        msg.extend_from_slice(assignee);
    }
    public
        .verify(&msg, &signature)
        .map_err(|_| KeeperError::InvalidSignature)
}

/// Parses and authenticates the 192-byte assignee blob: a public key
/// followed by that key's signature over its own bytes.
fn check_assignee(assignee: &str) -> Result<Vec<u8>, KeeperError> {
    let bytes = hex::decode(assignee).map_err(|_| KeeperError::InvalidAssignee)?;
    if bytes.len() != PUBLIC_KEY_SIZE + 64 {
        return Err(KeeperError::InvalidAssignee);
    }
    let public = PublicKey::from_bytes(&bytes[..PUBLIC_KEY_SIZE])
        .map_err(|_| KeeperError::InvalidAssignee)?;
    let signature = Signature::from_bytes(&bytes[PUBLIC_KEY_SIZE..])
        .map_err(|_| KeeperError::InvalidAssignee)?;
    public
        .verify(&bytes[..PUBLIC_KEY_SIZE], &signature)
        .map_err(|_| KeeperError::InvalidAssignee)?;
    Ok(bytes)
}

fn limit_key(assignor: &[u8], tag: &[u8]) -> Vec<u8> {
    let mut key = assignor.to_vec();
    key.extend_from_slice(tag);
    key
}

/// Parses a hex big-integer into its minimal big-endian bytes, the way
/// clients serialize ephemerals. Odd-length strings are accepted; leading
/// zeroes are stripped.
fn parse_hex_uint(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let padded = if s.len() % 2 == 1 {
        let mut padded = String::with_capacity(s.len() + 1);
        padded.push('0');
        padded.push_str(s);
        padded
    } else {
        s.to_string()
    };
    let bytes = hex::decode(padded).ok()?;
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    Some(bytes[first..].to_vec())
}
