//! Shared wire types for the TIP (Throttled Identity PIN) custodian network.
//!
//! This crate defines the JSON types exchanged between clients and signer
//! nodes. The cryptographic types themselves (keys, signatures, partials)
//! live in `tip-core`; everything here is plain serde data so that the
//! client SDK and the service agree on one wire contract.

pub mod api;

pub use api::{
    Action, InfoData, InfoSigner, SignBody, SignData, SignRequest, WatchData,
};
