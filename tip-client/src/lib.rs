//! Client SDK for the TIP custodian network.
//!
//! A [`Client`] fans one sign request out to every signer, decrypts the
//! returned partials, groups them by the assignor the signers report, and
//! recovers the deterministic threshold signature, the caller's
//! PIN-derived secret. Signers that answer inconsistently with the
//! configured group are evicted rather than trusted.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;
use sha3::{Digest, Sha3_256};
use tip_core::bls::PUBLIC_KEY_SIZE;
use tip_core::threshold::PARTIAL_SIZE;
use tip_core::{
    Commitments, CryptoError, PartialSignature, PublicKey, SecretKey, Signature, hybrid, threshold,
};
use tip_types::{Action, InfoData, SignBody, SignRequest, WatchData};
use tracing::instrument;

pub mod config;

pub use config::{ClientConfig, SignerEntry};

/// Grace floor the signers enforce; requests below it are lifted to it so
/// the signed preimage matches the server-side adjustment.
const DEFAULT_GRACE: Duration = Duration::from_secs(128 * 24 * 60 * 60);
/// Per-request deadline on the shared HTTP client.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Expected plaintext layout of a sign response:
/// `nonce || partial || assignor || genesis || counter`.
const SIGN_PLAINTEXT_SIZE: usize = 8 + PARTIAL_SIZE + PUBLIC_KEY_SIZE + 8 + 8;

/// Client-side failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration is empty or inconsistent.
    #[error("invalid client configuration")]
    InvalidConfig,
    /// A signer returned an API error.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    /// HTTP or network failure.
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    /// Too few signers survived config validation.
    #[error("only {n} signers available, need {threshold}")]
    NotEnoughSigners { n: usize, threshold: usize },
    /// Too few consistent partials to recover the signature.
    #[error("only {n} partials for the winning assignor, need {threshold}")]
    NotEnoughPartials { n: usize, threshold: usize },
    /// A signer response did not parse.
    #[error("malformed signer response")]
    InvalidResponse,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

struct SignerHandle {
    /// Base58 identity string, also the per-node ephemeral salt.
    name: String,
    identity: PublicKey,
    api: String,
}

/// A connected client, validated against the signer group.
pub struct Client {
    http: reqwest::Client,
    commitments: Commitments,
    signers: Vec<SignerHandle>,
    total: usize,
}

impl Client {
    /// Validates the configuration against every signer's info endpoint.
    /// Signers whose identity, group view or commitments disagree with
    /// the configuration are evicted; the evicted list is returned for
    /// diagnostics. Fails when fewer than `threshold` signers survive.
    pub async fn new(config: ClientConfig) -> Result<(Self, Vec<SignerEntry>), Error> {
        config.validate()?;
        let commitments = Commitments::new(
            config
                .commitments
                .iter()
                .map(|point| PublicKey::from_base58(point))
                .collect::<Result<Vec<_>, _>>()?,
        );
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let mut signers = Vec::new();
        let mut evicted = Vec::new();
        for entry in &config.signers {
            match validate_signer(&http, &config, entry).await {
                Ok(identity) => signers.push(SignerHandle {
                    name: entry.identity.clone(),
                    identity,
                    api: entry.api.clone(),
                }),
                Err(err) => {
                    tracing::info!(api = entry.api, "evicting signer: {err}");
                    evicted.push(entry.clone());
                }
            }
        }
        if signers.len() < config.threshold() {
            return Err(Error::NotEnoughSigners {
                n: signers.len(),
                threshold: config.threshold(),
            });
        }
        Ok((
            Self {
                http,
                commitments,
                signers,
                total: config.signers.len(),
            },
            evicted,
        ))
    }

    /// Requests a threshold signature over the caller's effective
    /// assignor.
    ///
    /// `key` and `ephemeral` are hex scalars; the ephemeral seed is
    /// salted per node before it leaves the client. `rotate` optionally
    /// replaces the ephemeral, `assignee` (a hex scalar) rotates the
    /// signing identity, `watcher` is the 32-byte hex observation key.
    /// Returns the recovered signature plus the signers that failed to
    /// contribute.
    #[allow(clippy::too_many_arguments)]
    #[instrument(level = "debug", skip_all)]
    pub async fn sign(
        &self,
        key: &str,
        ephemeral: &str,
        nonce: u64,
        grace: Duration,
        rotate: Option<&str>,
        assignee: Option<&str>,
        watcher: &str,
    ) -> Result<(Signature, Vec<SignerEntry>), Error> {
        let key = SecretKey::from_hex(key)?;
        // the raw seeds never leave the device, but they must be valid
        // scalars
        SecretKey::from_hex(ephemeral)?;
        if let Some(rotate) = rotate {
            SecretKey::from_hex(rotate)?;
        }
        let assignee_blob = assignee
            .map(|assignee| -> Result<Vec<u8>, Error> {
                let assignee = SecretKey::from_hex(assignee)?;
                let mut blob = assignee.public().to_bytes().to_vec();
                blob.extend_from_slice(&assignee.sign(&assignee.public().to_bytes()).to_bytes());
                Ok(blob)
            })
            .transpose()?;

        let mut evicted = Vec::new();
        let mut by_assignor: HashMap<Vec<u8>, Vec<PartialSignature>> = HashMap::new();
        for signer in &self.signers {
            let request = build_sign_request(
                &key,
                signer,
                ephemeral,
                nonce,
                grace,
                rotate,
                assignee_blob.as_deref(),
                watcher,
            );
            match self.request_partial(&key, signer, nonce, request).await {
                Ok((assignor, partial)) => {
                    by_assignor.entry(assignor).or_default().push(partial);
                }
                Err(err) => {
                    tracing::info!(api = signer.api, "signer failed: {err}");
                    evicted.push(SignerEntry {
                        identity: signer.name.clone(),
                        api: signer.api.clone(),
                    });
                }
            }
        }

        // the majority assignor wins; a minority of signers with a stale
        // assignee view just loses its partials
        let threshold = self.commitments.threshold();
        let Some((assignor, partials)) = by_assignor
            .into_iter()
            .max_by_key(|(_, partials)| partials.len())
        else {
            return Err(Error::NotEnoughPartials { n: 0, threshold });
        };
        if partials.len() < threshold {
            return Err(Error::NotEnoughPartials {
                n: partials.len(),
                threshold,
            });
        }

        let signature =
            threshold::recover(&self.commitments, &assignor, &partials, threshold, self.total)?;
        Ok((signature, evicted))
    }

    /// Reads the `(genesis, counter)` pair bound to a watcher key from
    /// the first responsive signer.
    pub async fn watch(&self, watcher: &str) -> Result<WatchData, Error> {
        let request = SignRequest {
            action: Action::Watch,
            watcher: watcher.to_string(),
            identity: String::new(),
            signature: String::new(),
            data: String::new(),
        };
        let mut last = Error::NotEnoughSigners {
            n: 0,
            threshold: 1,
        };
        for signer in &self.signers {
            match self.post(&signer.api, &request).await {
                Ok(value) => {
                    let data = value.get("data").cloned().ok_or(Error::InvalidResponse)?;
                    return serde_json::from_value(data).map_err(|_| Error::InvalidResponse);
                }
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    async fn post(&self, api: &str, request: &SignRequest) -> Result<Value, Error> {
        let response = self.http.post(api).json(request).send().await?;
        let status = response.status();
        let value: Value = response.json().await.map_err(|_| Error::InvalidResponse)?;
        if !status.is_success() {
            let message = value
                .pointer("/error/description")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(Error::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(value)
    }

    /// Sends one sign request and unpacks the signer's encrypted
    /// contribution.
    async fn request_partial(
        &self,
        key: &SecretKey,
        signer: &SignerHandle,
        nonce: u64,
        request: SignRequest,
    ) -> Result<(Vec<u8>, PartialSignature), Error> {
        let value = self.post(&signer.api, &request).await?;
        let cipher = value
            .pointer("/data/cipher")
            .and_then(Value::as_str)
            .ok_or(Error::InvalidResponse)?;
        let cipher = hex::decode(cipher).map_err(|_| Error::InvalidResponse)?;
        let plain = hybrid::decrypt(key, &signer.identity, &cipher)?;
        if plain.len() != SIGN_PLAINTEXT_SIZE {
            return Err(Error::InvalidResponse);
        }
        let echoed = u64::from_be_bytes(plain[..8].try_into().expect("8 bytes"));
        if echoed != nonce {
            return Err(Error::InvalidResponse);
        }
        let partial = PartialSignature::from_bytes(&plain[8..8 + PARTIAL_SIZE])?;
        let assignor = plain[8 + PARTIAL_SIZE..8 + PARTIAL_SIZE + PUBLIC_KEY_SIZE].to_vec();
        Ok((assignor, partial))
    }
}

/// Checks one signer's info endpoint against the configuration: its
/// identity, its view of the group, and its commitments must all match.
async fn validate_signer(
    http: &reqwest::Client,
    config: &ClientConfig,
    entry: &SignerEntry,
) -> Result<PublicKey, Error> {
    let value: Value = http
        .get(&entry.api)
        .send()
        .await?
        .json()
        .await
        .map_err(|_| Error::InvalidResponse)?;
    let data = value.get("data").cloned().ok_or(Error::InvalidResponse)?;
    let info: InfoData = serde_json::from_value(data).map_err(|_| Error::InvalidResponse)?;

    if info.identity != entry.identity {
        return Err(Error::InvalidResponse);
    }
    if info.signers.len() != config.signers.len()
        || info
            .signers
            .iter()
            .zip(&config.signers)
            .any(|(theirs, ours)| theirs.identity != ours.identity)
    {
        return Err(Error::InvalidResponse);
    }
    if info.commitments != config.commitments {
        return Err(Error::InvalidResponse);
    }
    Ok(PublicKey::from_base58(&entry.identity)?)
}

/// Builds the encrypted sign request towards one signer. The ephemeral
/// seed (and rotation seed) are salted with the signer's identity, so no
/// two nodes ever observe the same ephemeral.
#[allow(clippy::too_many_arguments)]
fn build_sign_request(
    key: &SecretKey,
    signer: &SignerHandle,
    ephemeral: &str,
    nonce: u64,
    grace: Duration,
    rotate: Option<&str>,
    assignee_blob: Option<&[u8]>,
    watcher: &str,
) -> SignRequest {
    let public = key.public();
    let identity = public.to_base58();
    // the signers lift short grace periods to their floor; sign the
    // adjusted value so the preimages agree
    let grace_ns = grace.max(DEFAULT_GRACE).as_nanos().min(u128::from(u64::MAX)) as u64;

    let esum = salted_seed(ephemeral, &signer.name);
    let rsum = rotate.map(|rotate| salted_seed(rotate, &signer.name));

    let mut msg = public.to_bytes().to_vec();
    msg.extend_from_slice(&esum);
    msg.extend_from_slice(&nonce.to_be_bytes());
    msg.extend_from_slice(&grace_ns.to_be_bytes());
    if let Some(rsum) = &rsum {
        msg.extend_from_slice(rsum);
    }
    if let Some(blob) = assignee_blob {
        msg.extend_from_slice(blob);
    }
    let signature = key.sign(&msg);

    let body = SignBody {
        identity: identity.clone(),
        assignee: assignee_blob.map(hex::encode).unwrap_or_default(),
        ephemeral: hex::encode(esum),
        grace: grace_ns,
        nonce,
        rotate: rsum.map(hex::encode).unwrap_or_default(),
        watcher: watcher.to_string(),
    };
    let plain = serde_json::to_vec(&body).expect("body serializes");
    let cipher = hybrid::encrypt(&mut rand::rngs::OsRng, key, &signer.identity, &plain);

    SignRequest {
        action: Action::Sign,
        watcher: watcher.to_string(),
        identity,
        signature: signature.to_hex(),
        data: URL_SAFE_NO_PAD.encode(cipher),
    }
}

/// `SHA3-256(seed || signer_name)`, binding a client seed to one node.
/// The digest is normalized to its big-integer byte form (no leading
/// zeroes), which is how the signers parse it back out of the hex body.
fn salted_seed(seed: &str, signer_name: &str) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    hasher.update(seed.as_bytes());
    hasher.update(signer_name.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    let first = digest.iter().position(|b| *b != 0).unwrap_or(digest.len());
    digest[first..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salted_seeds_differ_per_signer() {
        let one = salted_seed("00aa", "node-one");
        let two = salted_seed("00aa", "node-two");
        assert_ne!(one, two);
        assert_eq!(one, salted_seed("00aa", "node-one"));
        // normalized form never has a leading zero byte
        assert_ne!(one.first(), Some(&0));
        assert_ne!(two.first(), Some(&0));
    }

    #[test]
    fn sign_request_is_decryptable_by_the_signer() {
        let mut rng = rand::thread_rng();
        let user = SecretKey::random(&mut rng);
        let node = SecretKey::random(&mut rng);
        let signer = SignerHandle {
            name: node.public().to_base58(),
            identity: node.public(),
            api: "http://localhost".into(),
        };

        let request = build_sign_request(
            &user,
            &signer,
            "0badc0de",
            1024,
            DEFAULT_GRACE,
            None,
            None,
            &"ab".repeat(32),
        );
        assert_eq!(request.action, Action::Sign);
        assert_eq!(request.identity, user.public().to_base58());

        // the signer opens the payload with the mirrored key pair and
        // finds the envelope identity inside
        let cipher = URL_SAFE_NO_PAD.decode(&request.data).unwrap();
        let plain = hybrid::decrypt(&node, &user.public(), &cipher).unwrap();
        let body: SignBody = serde_json::from_slice(&plain).unwrap();
        assert_eq!(body.identity, request.identity);
        assert_eq!(body.nonce, 1024);
        assert_eq!(
            hex::decode(&body.ephemeral).unwrap(),
            salted_seed("0badc0de", &signer.name)
        );

        // the outer signature covers identity, ephemeral, nonce and grace
        let mut msg = user.public().to_bytes().to_vec();
        msg.extend_from_slice(&salted_seed("0badc0de", &signer.name));
        msg.extend_from_slice(&1024u64.to_be_bytes());
        msg.extend_from_slice(&(DEFAULT_GRACE.as_nanos() as u64).to_be_bytes());
        let signature = Signature::from_hex(&request.signature).unwrap();
        user.public().verify(&msg, &signature).unwrap();
    }

    #[test]
    fn grace_is_lifted_to_the_floor() {
        let mut rng = rand::thread_rng();
        let user = SecretKey::random(&mut rng);
        let node = SecretKey::random(&mut rng);
        let signer = SignerHandle {
            name: node.public().to_base58(),
            identity: node.public(),
            api: "http://localhost".into(),
        };

        let request = build_sign_request(
            &user,
            &signer,
            "ff",
            1,
            Duration::from_secs(60),
            None,
            None,
            &"cd".repeat(32),
        );
        let cipher = URL_SAFE_NO_PAD.decode(&request.data).unwrap();
        let plain = hybrid::decrypt(&node, &user.public(), &cipher).unwrap();
        let body: SignBody = serde_json::from_slice(&plain).unwrap();
        assert_eq!(body.grace, DEFAULT_GRACE.as_nanos() as u64);
    }
}
