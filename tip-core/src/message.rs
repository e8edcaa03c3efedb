//! The signed envelope carried by the broadcast bus.
//!
//! Every bus payload is a [`Message`]: an action discriminant, the sender's
//! 128-byte public key, the bundle payload, and a BLS signature. The signed
//! preimage is the envelope encoding with an empty signature field, so a
//! receiver can rebuild it from the decoded message alone.

use crate::bls::{CryptoError, PublicKey, SecretKey, Signature};
use crate::codec::{CodecError, Decoder, Encoder};

/// Broadcast action requesting a DKG setup quorum.
pub const ACTION_SETUP: u32 = 7000;
/// Broadcast action carrying a DKG deal bundle.
pub const ACTION_DKG_DEAL: u32 = 7001;
/// Broadcast action carrying a DKG response bundle.
pub const ACTION_DKG_RESPONSE: u32 = 7002;
/// Broadcast action carrying a DKG justification bundle.
pub const ACTION_DKG_JUSTIFY: u32 = 7003;

/// A signed broadcast envelope.
#[derive(Clone, Debug)]
pub struct Message {
    pub action: u32,
    pub sender: PublicKey,
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Message {
    /// Builds and signs an envelope with the sender's long-term key.
    pub fn sign(action: u32, key: &SecretKey, data: Vec<u8>) -> Self {
        let mut msg = Self {
            action,
            sender: key.public(),
            data,
            signature: Vec::new(),
        };
        msg.signature = key.sign(&msg.encode()).to_bytes().to_vec();
        msg
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u32(self.action);
        enc.write_fixed_bytes(&self.sender.to_bytes());
        enc.write_fixed_bytes(&self.data);
        enc.write_fixed_bytes(&self.signature);
        enc.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut dec = Decoder::new(bytes);
        let action = dec.read_u32()?;
        let sender =
            PublicKey::from_bytes(dec.read_fixed_bytes()?).map_err(|_| CodecError::Malformed)?;
        let data = dec.read_fixed_bytes()?.to_vec();
        let signature = dec.read_fixed_bytes()?.to_vec();
        dec.finish()?;
        Ok(Self {
            action,
            sender,
            data,
            signature,
        })
    }

    /// Checks the envelope signature against the embedded sender key. The
    /// caller still decides whether that sender is authorized.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let signature = Signature::from_bytes(&self.signature)?;
        let preimage = Self {
            action: self.action,
            sender: self.sender,
            data: self.data.clone(),
            signature: Vec::new(),
        }
        .encode();
        self.sender.verify(&preimage, &signature)
    }
}
