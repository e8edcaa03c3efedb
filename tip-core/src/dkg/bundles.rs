//! Wire bundles exchanged during a DKG run.
//!
//! Each bundle carries the session id of its run and a BLS signature by the
//! sender's long-term key over the bundle encoding with an empty signature
//! field. The deal bundle is additionally prefixed on the wire by the setup
//! nonce, which lets a node that missed the setup quorum start its own run
//! from the first deal it observes.

use ark_bn254::Fr;

use crate::bls::{PublicKey, scalar_from_bytes, scalar_to_bytes};
use crate::codec::{CodecError, Decoder, Encoder};

/// One encrypted polynomial evaluation addressed to a share index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deal {
    pub share_index: u32,
    pub encrypted_share: Vec<u8>,
}

/// A dealer's contribution: its commitments and one encrypted share per
/// member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DealBundle {
    pub dealer_index: u32,
    pub deals: Vec<Deal>,
    pub commitments: Vec<PublicKey>,
    pub session_id: Vec<u8>,
    pub signature: Vec<u8>,
}

/// A member's verdict on one dealer's deal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Response {
    pub dealer_index: u32,
    pub status: bool,
}

/// A member's verdicts on every dealer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseBundle {
    pub share_index: u32,
    pub responses: Vec<Response>,
    pub session_id: Vec<u8>,
    pub signature: Vec<u8>,
}

/// One opened share, answering a complaint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Justification {
    pub share_index: u32,
    pub share: Fr,
}

/// A dealer's answer to the complaints raised against it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JustificationBundle {
    pub dealer_index: u32,
    pub justifications: Vec<Justification>,
    pub session_id: Vec<u8>,
    pub signature: Vec<u8>,
}

/// The broadcast asking the group to start a DKG run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupBundle {
    pub nonce: u64,
    pub timestamp_ns: u64,
}

impl DealBundle {
    fn encode_inner(&self, nonce: u64, signature: &[u8]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u64(nonce);
        enc.write_u32(self.dealer_index);
        enc.write_u32(self.deals.len() as u32);
        for deal in &self.deals {
            enc.write_u32(deal.share_index);
            enc.write_fixed_bytes(&deal.encrypted_share);
        }
        enc.write_u32(self.commitments.len() as u32);
        for point in &self.commitments {
            enc.write_fixed_bytes(&point.to_bytes());
        }
        enc.write_fixed_bytes(&self.session_id);
        enc.write_fixed_bytes(signature);
        enc.into_bytes()
    }

    pub fn encode(&self, nonce: u64) -> Vec<u8> {
        self.encode_inner(nonce, &self.signature)
    }

    /// The signed preimage: the encoding with an empty signature.
    pub fn preimage(&self, nonce: u64) -> Vec<u8> {
        self.encode_inner(nonce, &[])
    }

    /// Decodes the wire form, returning the setup nonce prefix alongside
    /// the bundle.
    pub fn decode(bytes: &[u8]) -> Result<(u64, Self), CodecError> {
        let mut dec = Decoder::new(bytes);
        let nonce = dec.read_u64()?;
        let dealer_index = dec.read_u32()?;

        let n_deals = dec.read_u32()?;
        let mut deals = Vec::with_capacity(n_deals.min(1024) as usize);
        for _ in 0..n_deals {
            deals.push(Deal {
                share_index: dec.read_u32()?,
                encrypted_share: dec.read_fixed_bytes()?.to_vec(),
            });
        }

        let n_commitments = dec.read_u32()?;
        let mut commitments = Vec::with_capacity(n_commitments.min(1024) as usize);
        for _ in 0..n_commitments {
            let point = PublicKey::from_bytes(dec.read_fixed_bytes()?)
                .map_err(|_| CodecError::Malformed)?;
            commitments.push(point);
        }

        let session_id = dec.read_fixed_bytes()?.to_vec();
        let signature = dec.read_fixed_bytes()?.to_vec();
        dec.finish()?;
        Ok((
            nonce,
            Self {
                dealer_index,
                deals,
                commitments,
                session_id,
                signature,
            },
        ))
    }
}

impl ResponseBundle {
    fn encode_inner(&self, signature: &[u8]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u32(self.share_index);
        enc.write_u32(self.responses.len() as u32);
        for response in &self.responses {
            enc.write_u32(response.dealer_index);
            enc.write_bool(response.status);
        }
        enc.write_fixed_bytes(&self.session_id);
        enc.write_fixed_bytes(signature);
        enc.into_bytes()
    }

    pub fn encode(&self) -> Vec<u8> {
        self.encode_inner(&self.signature)
    }

    pub fn preimage(&self) -> Vec<u8> {
        self.encode_inner(&[])
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut dec = Decoder::new(bytes);
        let share_index = dec.read_u32()?;
        let n_responses = dec.read_u32()?;
        let mut responses = Vec::with_capacity(n_responses.min(1024) as usize);
        for _ in 0..n_responses {
            responses.push(Response {
                dealer_index: dec.read_u32()?,
                status: dec.read_bool()?,
            });
        }
        let session_id = dec.read_fixed_bytes()?.to_vec();
        let signature = dec.read_fixed_bytes()?.to_vec();
        dec.finish()?;
        Ok(Self {
            share_index,
            responses,
            session_id,
            signature,
        })
    }
}

impl JustificationBundle {
    fn encode_inner(&self, signature: &[u8]) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u32(self.dealer_index);
        enc.write_u32(self.justifications.len() as u32);
        for justification in &self.justifications {
            enc.write_u32(justification.share_index);
            enc.write_fixed_bytes(&scalar_to_bytes(&justification.share));
        }
        enc.write_fixed_bytes(&self.session_id);
        enc.write_fixed_bytes(signature);
        enc.into_bytes()
    }

    pub fn encode(&self) -> Vec<u8> {
        self.encode_inner(&self.signature)
    }

    pub fn preimage(&self) -> Vec<u8> {
        self.encode_inner(&[])
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut dec = Decoder::new(bytes);
        let dealer_index = dec.read_u32()?;
        let n_justifications = dec.read_u32()?;
        let mut justifications = Vec::with_capacity(n_justifications.min(1024) as usize);
        for _ in 0..n_justifications {
            justifications.push(Justification {
                share_index: dec.read_u32()?,
                share: scalar_from_bytes(dec.read_fixed_bytes()?),
            });
        }
        let session_id = dec.read_fixed_bytes()?.to_vec();
        let signature = dec.read_fixed_bytes()?.to_vec();
        dec.finish()?;
        Ok(Self {
            dealer_index,
            justifications,
            session_id,
            signature,
        })
    }
}

impl SetupBundle {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u64(self.nonce);
        enc.write_u64(self.timestamp_ns);
        enc.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut dec = Decoder::new(bytes);
        let nonce = dec.read_u64()?;
        let timestamp_ns = dec.read_u64()?;
        dec.finish()?;
        Ok(Self {
            nonce,
            timestamp_ns,
        })
    }
}
