//! The DKG protocol engine.
//!
//! [`Dkg`] is a synchronous state machine. The owning task decodes bundles
//! from the bus and feeds them in; phase timing (when to emit responses,
//! justifications, and when to finalize) is driven from outside. Bundles
//! from foreign sessions, unknown indices or with bad signatures are
//! rejected; bundles already processed are ignored, so at-least-once
//! delivery on the bus is harmless.

use std::collections::{BTreeMap, BTreeSet};

use ark_bn254::{Fr, G2Projective};
use ark_ec::{AffineRepr, CurveGroup};
use ark_ff::{UniformRand, Zero};
use rand::{CryptoRng, Rng};

use crate::bls::{CryptoError, PublicKey, SecretKey, Signature};
use crate::codec::CodecError;
use crate::dkg::bundles::{
    Deal, DealBundle, Justification, JustificationBundle, Response, ResponseBundle,
};
use crate::dkg::session_id;
use crate::hybrid;
use crate::threshold::{Commitments, PrivateShare, evaluate_poly};

/// Parameters of one DKG run.
#[derive(Clone)]
pub struct DkgConfig {
    /// This node's long-term key.
    pub secret: SecretKey,
    /// The full signer group, sorted by base58 identity.
    pub members: Vec<PublicKey>,
    /// Number of commitments, `2N/3 + 1`.
    pub threshold: usize,
    /// The agreed setup nonce distinguishing this run.
    pub nonce: u64,
}

/// DKG failures.
#[derive(Debug, thiserror::Error)]
pub enum DkgError {
    /// The node key is not a member of the configured group.
    #[error("node key is not in the signer group")]
    NotInGroup,
    /// Threshold is zero or exceeds the group size.
    #[error("invalid threshold {threshold} for {members} members")]
    InvalidThreshold { threshold: usize, members: usize },
    /// The bundle belongs to a different session.
    #[error("bundle from a foreign session")]
    WrongSession,
    /// A dealer or responder index is outside the group.
    #[error("member index {0} out of range")]
    UnknownMember(u32),
    /// The bundle signature does not verify against the sender's key.
    #[error("bundle signature check failed")]
    UnauthenticatedBundle,
    /// A dealer committed to the wrong number of coefficients.
    #[error("dealer committed {got} coefficients, expected {want}")]
    BadCommitments { got: usize, want: usize },
    /// Fewer qualified dealers than the threshold at finalization.
    #[error("only {qualified} qualified dealers, need {threshold}")]
    TooFewDealers { qualified: usize, threshold: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// What this node holds about one dealer after processing its deal.
struct ReceivedDeal {
    commitments: Vec<PublicKey>,
    /// Our decrypted and verified share of the dealer's polynomial.
    /// `None` marks a missing, undecryptable or inconsistent deal and
    /// turns into a complaint in our response bundle.
    share: Option<Fr>,
}

/// The per-run protocol state of one signer.
pub struct Dkg {
    config: DkgConfig,
    session: Vec<u8>,
    index: u32,
    /// Our dealer polynomial, low to high coefficients.
    poly: Vec<Fr>,
    received: BTreeMap<u32, ReceivedDeal>,
    responders: BTreeSet<u32>,
    /// dealer -> accusers with unresolved complaints
    complaints: BTreeMap<u32, BTreeSet<u32>>,
    justifiers: BTreeSet<u32>,
}

impl Dkg {
    /// Samples a fresh dealer polynomial and locates this node inside the
    /// group.
    pub fn new<R: Rng + CryptoRng>(config: DkgConfig, rng: &mut R) -> Result<Self, DkgError> {
        if config.threshold == 0 || config.threshold > config.members.len() {
            return Err(DkgError::InvalidThreshold {
                threshold: config.threshold,
                members: config.members.len(),
            });
        }
        let public = config.secret.public();
        let index = config
            .members
            .iter()
            .position(|member| *member == public)
            .ok_or(DkgError::NotInGroup)? as u32;

        let poly = (0..config.threshold).map(|_| Fr::rand(rng)).collect();
        let session = session_id(&config.members, config.nonce);
        Ok(Self {
            config,
            session,
            index,
            poly,
            received: BTreeMap::new(),
            responders: BTreeSet::new(),
            complaints: BTreeMap::new(),
            justifiers: BTreeSet::new(),
        })
    }

    /// This node's position in the sorted group.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn session(&self) -> &[u8] {
        &self.session
    }

    fn member(&self, index: u32) -> Result<&PublicKey, DkgError> {
        self.config
            .members
            .get(index as usize)
            .ok_or(DkgError::UnknownMember(index))
    }

    fn check_session(&self, session: &[u8]) -> Result<(), DkgError> {
        if session == self.session {
            Ok(())
        } else {
            Err(DkgError::WrongSession)
        }
    }

    fn verify_bundle(
        &self,
        sender: u32,
        preimage: &[u8],
        signature: &[u8],
    ) -> Result<(), DkgError> {
        let signature =
            Signature::from_bytes(signature).map_err(|_| DkgError::UnauthenticatedBundle)?;
        self.member(sender)?
            .verify(preimage, &signature)
            .map_err(|_| DkgError::UnauthenticatedBundle)
    }

    /// Builds this node's signed deal bundle: one hybrid-encrypted
    /// polynomial evaluation per member and the G2 commitments to every
    /// coefficient.
    pub fn deal_bundle<R: Rng + CryptoRng>(&self, rng: &mut R) -> DealBundle {
        let commitments = self
            .poly
            .iter()
            .map(|coefficient| {
                PublicKey((ark_bn254::G2Affine::generator() * *coefficient).into_affine())
            })
            .collect();
        let deals = self
            .config
            .members
            .iter()
            .enumerate()
            .map(|(i, member)| {
                let share = evaluate_poly(&self.poly, i as u32);
                Deal {
                    share_index: i as u32,
                    encrypted_share: hybrid::encrypt(
                        rng,
                        &self.config.secret,
                        member,
                        &crate::bls::scalar_to_bytes(&share),
                    ),
                }
            })
            .collect();
        let mut bundle = DealBundle {
            dealer_index: self.index,
            deals,
            commitments,
            session_id: self.session.clone(),
            signature: Vec::new(),
        };
        bundle.signature = self
            .config
            .secret
            .sign(&bundle.preimage(self.config.nonce))
            .to_bytes()
            .to_vec();
        bundle
    }

    /// Processes a dealer's bundle, including our own when the bus echoes
    /// it back. Decrypts and checks our share against the dealer's
    /// commitments; a failed check is remembered and turns into a
    /// complaint.
    pub fn process_deal(&mut self, bundle: &DealBundle) -> Result<(), DkgError> {
        self.check_session(&bundle.session_id)?;
        let dealer = bundle.dealer_index;
        let dealer_key = *self.member(dealer)?;
        if self.received.contains_key(&dealer) {
            return Ok(());
        }
        self.verify_bundle(
            dealer,
            &bundle.preimage(self.config.nonce),
            &bundle.signature,
        )?;
        if bundle.commitments.len() != self.config.threshold {
            return Err(DkgError::BadCommitments {
                got: bundle.commitments.len(),
                want: self.config.threshold,
            });
        }

        let share = bundle
            .deals
            .iter()
            .find(|deal| deal.share_index == self.index)
            .and_then(|deal| {
                hybrid::decrypt(&self.config.secret, &dealer_key, &deal.encrypted_share).ok()
            })
            .map(|plain| crate::bls::scalar_from_bytes(&plain))
            .filter(|share| share_matches(&bundle.commitments, self.index, share));

        self.received.insert(
            dealer,
            ReceivedDeal {
                commitments: bundle.commitments.clone(),
                share,
            },
        );
        Ok(())
    }

    /// Builds this node's signed response bundle with one status per
    /// member: `true` for dealers whose share verified, `false` for
    /// missing or inconsistent deals.
    pub fn response_bundle(&self) -> ResponseBundle {
        let responses = (0..self.config.members.len() as u32)
            .map(|dealer| Response {
                dealer_index: dealer,
                status: self
                    .received
                    .get(&dealer)
                    .is_some_and(|deal| deal.share.is_some()),
            })
            .collect();
        let mut bundle = ResponseBundle {
            share_index: self.index,
            responses,
            session_id: self.session.clone(),
            signature: Vec::new(),
        };
        bundle.signature = self
            .config
            .secret
            .sign(&bundle.preimage())
            .to_bytes()
            .to_vec();
        bundle
    }

    /// Records a member's verdicts; negative statuses become complaints
    /// that the accused dealer must justify.
    pub fn process_response(&mut self, bundle: &ResponseBundle) -> Result<(), DkgError> {
        self.check_session(&bundle.session_id)?;
        let responder = bundle.share_index;
        self.member(responder)?;
        if !self.responders.insert(responder) {
            return Ok(());
        }
        self.verify_bundle(responder, &bundle.preimage(), &bundle.signature)?;
        for response in &bundle.responses {
            if response.dealer_index as usize >= self.config.members.len() {
                return Err(DkgError::UnknownMember(response.dealer_index));
            }
            if !response.status {
                self.complaints
                    .entry(response.dealer_index)
                    .or_default()
                    .insert(responder);
            }
        }
        Ok(())
    }

    /// Opens the shares of everyone who complained about us, if anyone
    /// did.
    pub fn justification_bundle(&self) -> Option<JustificationBundle> {
        let accusers = self.complaints.get(&self.index)?;
        let justifications = accusers
            .iter()
            .map(|accuser| Justification {
                share_index: *accuser,
                share: evaluate_poly(&self.poly, *accuser),
            })
            .collect();
        let mut bundle = JustificationBundle {
            dealer_index: self.index,
            justifications,
            session_id: self.session.clone(),
            signature: Vec::new(),
        };
        bundle.signature = self
            .config
            .secret
            .sign(&bundle.preimage())
            .to_bytes()
            .to_vec();
        Some(bundle)
    }

    /// Verifies opened shares against the dealer's commitments, clearing
    /// the complaints they answer. A justification addressed to us also
    /// repairs our missing share.
    pub fn process_justification(&mut self, bundle: &JustificationBundle) -> Result<(), DkgError> {
        self.check_session(&bundle.session_id)?;
        let dealer = bundle.dealer_index;
        self.member(dealer)?;
        if !self.justifiers.insert(dealer) {
            return Ok(());
        }
        self.verify_bundle(dealer, &bundle.preimage(), &bundle.signature)?;
        // without the dealer's commitments nothing can be checked and its
        // complaints stay unresolved
        let Some(received) = self.received.get_mut(&dealer) else {
            return Ok(());
        };
        for justification in &bundle.justifications {
            if !share_matches(
                &received.commitments,
                justification.share_index,
                &justification.share,
            ) {
                continue;
            }
            if let Some(accusers) = self.complaints.get_mut(&dealer) {
                accusers.remove(&justification.share_index);
                if accusers.is_empty() {
                    self.complaints.remove(&dealer);
                }
            }
            if justification.share_index == self.index && received.share.is_none() {
                received.share = Some(justification.share);
            }
        }
        Ok(())
    }

    /// Closes the run. Qualified dealers are those whose share we hold and
    /// against whom no complaint is left standing; the group polynomial is
    /// the sum of their contributions.
    pub fn finalize(self) -> Result<(PrivateShare, Commitments), DkgError> {
        let qualified: Vec<&ReceivedDeal> = self
            .received
            .iter()
            .filter(|(dealer, deal)| deal.share.is_some() && !self.complaints.contains_key(dealer))
            .map(|(_, deal)| deal)
            .collect();
        if qualified.len() < self.config.threshold {
            return Err(DkgError::TooFewDealers {
                qualified: qualified.len(),
                threshold: self.config.threshold,
            });
        }

        let mut share = Fr::zero();
        let mut commitments = vec![G2Projective::zero(); self.config.threshold];
        for deal in &qualified {
            share += deal.share.expect("qualified dealers have a share");
            for (acc, point) in commitments.iter_mut().zip(&deal.commitments) {
                *acc += point.0;
            }
        }
        let commitments = Commitments::new(
            commitments
                .into_iter()
                .map(|point| PublicKey(point.into_affine()))
                .collect(),
        );
        Ok((PrivateShare::new(self.index, share), commitments))
    }
}

/// Checks a claimed evaluation against a commitment polynomial:
/// `share·G2 == Σ C_j·(index+1)^j`.
fn share_matches(commitments: &[PublicKey], index: u32, share: &Fr) -> bool {
    let expected = Commitments::new(commitments.to_vec()).evaluate(index);
    PublicKey((ark_bn254::G2Affine::generator() * *share).into_affine()) == expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threshold;

    fn test_group(n: usize) -> (Vec<SecretKey>, Vec<PublicKey>) {
        let mut rng = rand::thread_rng();
        let mut keys: Vec<SecretKey> = (0..n).map(|_| SecretKey::random(&mut rng)).collect();
        keys.sort_by_key(|key| key.public().to_base58());
        let members = keys.iter().map(|key| key.public()).collect();
        (keys, members)
    }

    fn run_nodes(keys: &[SecretKey], members: &[PublicKey], threshold: usize) -> Vec<Dkg> {
        let mut rng = rand::thread_rng();
        keys.iter()
            .map(|key| {
                Dkg::new(
                    DkgConfig {
                        secret: key.clone(),
                        members: members.to_vec(),
                        threshold,
                        nonce: 1 << 20,
                    },
                    &mut rng,
                )
                .unwrap()
            })
            .collect()
    }

    #[test]
    fn four_nodes_agree_on_a_three_of_four_key() {
        let mut rng = rand::thread_rng();
        let (keys, members) = test_group(4);
        let mut nodes = run_nodes(&keys, &members, 3);

        let deals: Vec<_> = nodes.iter().map(|n| n.deal_bundle(&mut rng)).collect();
        for node in nodes.iter_mut() {
            for deal in &deals {
                node.process_deal(deal).unwrap();
            }
        }
        let responses: Vec<_> = nodes.iter().map(|n| n.response_bundle()).collect();
        for (i, response) in responses.iter().enumerate() {
            assert!(response.responses.iter().all(|r| r.status), "node {i}");
        }
        for node in nodes.iter_mut() {
            for response in &responses {
                node.process_response(response).unwrap();
            }
            assert!(node.justification_bundle().is_none());
        }

        let outputs: Vec<_> = nodes
            .into_iter()
            .map(|node| node.finalize().unwrap())
            .collect();
        for (i, (share, commitments)) in outputs.iter().enumerate() {
            assert_eq!(share.index, i as u32);
            assert_eq!(commitments.to_bytes(), outputs[0].1.to_bytes());
        }

        // any three shares recover a signature verifying against the
        // shared commitment
        let msg = b"first boot";
        let partials: Vec<_> = outputs[1..]
            .iter()
            .map(|(share, _)| share.partial_sign(msg))
            .collect();
        let sig = threshold::recover(&outputs[0].1, msg, &partials, 3, 4).unwrap();
        outputs[0].1.public_key().verify(msg, &sig).unwrap();
    }

    #[test]
    fn corrupted_deal_is_repaired_by_justification() {
        let mut rng = rand::thread_rng();
        let (keys, members) = test_group(4);
        let mut nodes = run_nodes(&keys, &members, 3);

        let mut deals: Vec<_> = nodes.iter().map(|n| n.deal_bundle(&mut rng)).collect();
        // dealer 0 garbles the share addressed to node 2
        let victim = deals[0]
            .deals
            .iter_mut()
            .find(|d| d.share_index == 2)
            .unwrap();
        victim.encrypted_share[20] ^= 1;
        // re-sign, the dealer is honest on the wire
        deals[0].signature = keys[0]
            .sign(&deals[0].preimage(1 << 20))
            .to_bytes()
            .to_vec();

        for node in nodes.iter_mut() {
            for deal in &deals {
                node.process_deal(deal).unwrap();
            }
        }
        let responses: Vec<_> = nodes.iter().map(|n| n.response_bundle()).collect();
        assert!(!responses[2].responses[0].status);
        for node in nodes.iter_mut() {
            for response in &responses {
                node.process_response(response).unwrap();
            }
        }

        let justification = nodes[0].justification_bundle().unwrap();
        assert_eq!(justification.justifications.len(), 1);
        for node in nodes.iter_mut() {
            node.process_justification(&justification).unwrap();
        }

        let outputs: Vec<_> = nodes
            .into_iter()
            .map(|node| node.finalize().unwrap())
            .collect();
        assert_eq!(outputs[2].1.to_bytes(), outputs[0].1.to_bytes());
    }

    #[test]
    fn unresolved_complaint_disqualifies_the_dealer() {
        let mut rng = rand::thread_rng();
        let (keys, members) = test_group(4);
        let mut nodes = run_nodes(&keys, &members, 3);

        let mut deals: Vec<_> = nodes.iter().map(|n| n.deal_bundle(&mut rng)).collect();
        let victim = deals[3]
            .deals
            .iter_mut()
            .find(|d| d.share_index == 1)
            .unwrap();
        victim.encrypted_share[20] ^= 1;
        deals[3].signature = keys[3]
            .sign(&deals[3].preimage(1 << 20))
            .to_bytes()
            .to_vec();

        // node 1 complains and dealer 3 never justifies
        for node in nodes.iter_mut() {
            for deal in &deals {
                node.process_deal(deal).unwrap();
            }
        }
        let responses: Vec<_> = nodes.iter().map(|n| n.response_bundle()).collect();
        for node in nodes.iter_mut() {
            for response in &responses {
                node.process_response(response).unwrap();
            }
        }

        let (_, commitments) = nodes.remove(0).finalize().unwrap();
        // only dealers 0..=2 qualify, their sum is still a valid 3-of-4 key
        let mut expected = G2Projective::zero();
        for deal in deals.iter().take(3) {
            expected += deal.commitments[0].0;
        }
        assert_eq!(
            commitments.public_key(),
            PublicKey(expected.into_affine())
        );
    }

    #[test]
    fn foreign_session_bundles_are_rejected() {
        let mut rng = rand::thread_rng();
        let (keys, members) = test_group(4);
        let mut nodes = run_nodes(&keys, &members, 3);

        let foreign = Dkg::new(
            DkgConfig {
                secret: keys[0].clone(),
                members: members.clone(),
                threshold: 3,
                nonce: 999,
            },
            &mut rng,
        )
        .unwrap();
        let bundle = foreign.deal_bundle(&mut rng);
        assert!(matches!(
            nodes[1].process_deal(&bundle),
            Err(DkgError::WrongSession)
        ));
    }

    #[test]
    fn outsider_key_is_rejected() {
        let mut rng = rand::thread_rng();
        let (_, members) = test_group(4);
        let outsider = SecretKey::random(&mut rng);
        let result = Dkg::new(
            DkgConfig {
                secret: outsider,
                members,
                threshold: 3,
                nonce: 1,
            },
            &mut rng,
        );
        assert!(matches!(result, Err(DkgError::NotInGroup)));
    }
}
