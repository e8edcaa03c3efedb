//! Core cryptography of the TIP (Throttled Identity PIN) custodian network.
//!
//! The crate is pure computation: no IO, no async. It provides
//!
//! - BLS signatures on BN254 with G2 public keys and G1 signatures
//!   ([`bls`]),
//! - the ECDH-derived AES-GCM hybrid encryption used for request payloads
//!   and DKG deal shares ([`hybrid`]),
//! - threshold-BLS partials and signature recovery ([`threshold`]),
//! - the deterministic length-prefixed wire codec ([`codec`]) and the
//!   signed broadcast [`message`] envelope,
//! - the distributed key generation engine ([`dkg`]) that produces each
//!   signer's polynomial share and the group commitments.

pub mod bls;
pub mod codec;
pub mod dkg;
pub mod hybrid;
pub mod message;
pub mod threshold;

pub use bls::{CryptoError, PublicKey, SecretKey, Signature};
pub use codec::{CodecError, Decoder, Encoder};
pub use threshold::{Commitments, PartialSignature, PrivateShare};
