//! Distributed key generation over the broadcast bus.
//!
//! One DKG run produces, at every signer, the same group [`Commitments`]
//! and a distinct [`PrivateShare`] whose index equals the signer's position
//! in the sorted group. The protocol is the classic three-phase sharing:
//! every member deals an encrypted evaluation of a secret polynomial to
//! every other member, members broadcast per-dealer verification statuses,
//! and accused dealers justify themselves by opening the disputed shares.
//! Phase timing is owned by the caller; the [`state::Dkg`] engine itself is
//! a synchronous state machine fed with decoded bundles.

use sha3::{Digest, Sha3_256};

use crate::bls::PublicKey;

pub mod bundles;
pub mod state;

pub use bundles::{Deal, DealBundle, Justification, JustificationBundle, Response, ResponseBundle, SetupBundle};
pub use state::{Dkg, DkgConfig, DkgError};

/// Derives the session id binding one DKG run: the SHA3-256 of the sorted
/// member keys followed by the big-endian setup nonce.
pub fn session_id(members: &[PublicKey], nonce: u64) -> Vec<u8> {
    let mut hasher = Sha3_256::new();
    for member in members {
        hasher.update(member.to_bytes());
    }
    hasher.update(nonce.to_be_bytes());
    hasher.finalize().to_vec()
}
