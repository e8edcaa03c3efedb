//! Request and response bodies of the signer HTTP API.
//!
//! The API is a single endpoint accepting `GET` (node info) and `POST`
//! (a [`SignRequest`] dispatched on its [`Action`]). Successful responses
//! are wrapped in a `{"data": …}` envelope with an optional sibling
//! `"signature"` produced by the node key; failures carry
//! `{"error": {"code": …, "description": …}}`.

use serde::{Deserialize, Serialize};

/// The operation requested by a `POST /`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Validate the request through the keeper and return a threshold partial.
    #[serde(rename = "SIGN")]
    Sign,
    /// Return the `(genesis, counter)` pair bound to a watcher key.
    #[serde(rename = "WATCH")]
    Watch,
}

/// Top-level body of a `POST /` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRequest {
    pub action: Action,
    /// Hex encoded 32-byte watcher key. Required for `WATCH`, informational
    /// for `SIGN` (the authoritative copy travels inside the ciphertext).
    #[serde(default)]
    pub watcher: String,
    /// Base58-check identity of the caller.
    #[serde(default)]
    pub identity: String,
    /// Hex encoded BLS signature over the request preimage.
    #[serde(default)]
    pub signature: String,
    /// Base64 (url-safe, no padding) hybrid ciphertext of the [`SignBody`].
    #[serde(default)]
    pub data: String,
}

/// The plaintext carried inside the encrypted `data` field of a SIGN request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignBody {
    /// Main identity public key, must match the outer `identity`.
    pub identity: String,
    /// Optional new identity to represent the main identity, hex encoded as
    /// 128-byte public key followed by a 64-byte self-signature.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assignee: String,
    /// The ephemeral secret to authenticate, as a hex big-integer.
    pub ephemeral: String,
    /// Grace period in nanoseconds keeping the ephemeral valid. Extended on
    /// each valid request; once expired the ephemeral may be reset.
    pub grace: u64,
    /// Strictly increasing per-ephemeral request nonce.
    pub nonce: u64,
    /// Optional ephemeral rotation, e.g. replacing an on-device random
    /// secret with a cooperatively generated one. Hex big-integer.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rotate: String,
    /// Hex encoded 32-byte key to watch the identity state.
    pub watcher: String,
}

/// Payload of a successful SIGN response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignData {
    /// Hex encoded hybrid ciphertext of
    /// `nonce || partial || assignor || genesis || counter`.
    pub cipher: String,
}

/// Payload of a successful WATCH response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchData {
    /// First-seen timestamp of the assignor, in unix nanoseconds.
    pub genesis: u64,
    /// Number of successful signs and assignee rotations.
    pub counter: u64,
}

/// One signer entry of the node info response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoSigner {
    /// Position in the lexicographically sorted signer list.
    pub index: u32,
    /// Base58-check public key.
    pub identity: String,
}

/// Payload of a `GET /` response describing the node and its group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoData {
    /// This node's base58-check identity.
    pub identity: String,
    /// The full ordered signer group.
    pub signers: Vec<InfoSigner>,
    /// Base58-check commitments of the group polynomial, empty until the
    /// DKG has completed.
    pub commitments: Vec<String>,
}
