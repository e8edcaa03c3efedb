//! The signer node lifecycle.
//!
//! On startup the node pins the signer-group identity, loads any persisted
//! poly state and either enters SERVING mode (the DKG is done, only
//! partial signing remains) or BOOTSTRAP mode, where it consumes the
//! broadcast bus until a DKG run completes. Setup requests accumulate per
//! sender until a quorum agrees on a nonce; a foreign deal also starts the
//! run lazily for nodes that missed the quorum.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha3::{Digest, Sha3_256};
use tip_core::dkg::{
    DealBundle, Dkg, DkgConfig, JustificationBundle, ResponseBundle, SetupBundle,
};
use tip_core::message::{
    ACTION_DKG_DEAL, ACTION_DKG_JUSTIFY, ACTION_DKG_RESPONSE, ACTION_SETUP, Message,
};
use tip_core::{Commitments, PrivateShare, PublicKey, SecretKey};
use tip_store::Storage;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::services::board::{Board, BoardInbox, BoardSenders, board_channels};
use crate::services::messenger::Messenger;

/// Maximum clock skew between two setup requests of the same round.
const SETUP_PERIOD: Duration = Duration::from_secs(300);

/// Signing threshold for a group of `n` members.
pub fn quorum(n: usize) -> usize {
    n * 2 / 3 + 1
}

/// One TIP signer.
pub struct SignerNode {
    storage: Storage,
    secret: SecretKey,
    identity: PublicKey,
    index: u32,
    signers: Vec<PublicKey>,
    period: Duration,

    share: Option<PrivateShare>,
    commitments: Option<Commitments>,

    setup_actions: HashMap<Vec<u8>, SetupBundle>,
    dkg_started: bool,
    board: Option<BoardSenders>,
}

impl SignerNode {
    /// Loads the node state: parses and sorts the signer group, pins the
    /// group identity in the store, and restores the poly state if a DKG
    /// already ran. The broadcast bus is only needed by [`Self::run`]; the
    /// api role never touches one.
    pub fn new(storage: Storage, config: &NodeConfig) -> eyre::Result<Self> {
        let secret = SecretKey::from_hex(&config.key)
            .map_err(|err| eyre::eyre!("invalid node key: {err}"))?;
        let identity = secret.public();

        let mut names = config.signers.clone();
        names.sort();
        let mut signers = Vec::with_capacity(names.len());
        let mut group = Vec::new();
        let mut index = None;
        for (i, name) in names.iter().enumerate() {
            let public = PublicKey::from_base58(name)
                .map_err(|err| eyre::eyre!("invalid signer {name}: {err}"))?;
            group.extend_from_slice(&public.to_bytes());
            if public == identity {
                index = Some(i as u32);
            }
            signers.push(public);
        }
        let index = index.ok_or_else(|| eyre::eyre!("node key is not in the signer list"))?;

        let group_id = Sha3_256::digest(&group);
        if !storage.check_poly_group(&group_id)? {
            eyre::bail!("signer group changed since the store was initialized");
        }

        tracing::info!("identity: {identity}");

        let commitments = storage
            .read_poly_public()?
            .map(|bytes| {
                tracing::info!("poly public: {}", hex::encode(&bytes));
                Commitments::from_bytes(&bytes)
            })
            .transpose()?;
        let share = storage
            .read_poly_share()?
            .map(|bytes| PrivateShare::from_bytes(&bytes))
            .transpose()?;
        if let Some(share) = &share {
            if share.index != index {
                eyre::bail!(
                    "stored share index {} does not match node index {index}",
                    share.index
                );
            }
        }

        Ok(Self {
            storage,
            secret,
            identity,
            index,
            signers,
            period: config.timeout,
            share,
            commitments,
            setup_actions: HashMap::new(),
            dkg_started: false,
            board: None,
        })
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn identity(&self) -> &PublicKey {
        &self.identity
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn signers(&self) -> &[PublicKey] {
        &self.signers
    }

    pub fn share(&self) -> Option<&PrivateShare> {
        self.share.as_ref()
    }

    pub fn commitments(&self) -> Option<&Commitments> {
        self.commitments.as_ref()
    }

    pub fn threshold(&self) -> usize {
        quorum(self.signers.len())
    }

    /// The message loop. Returns immediately in SERVING mode; in
    /// BOOTSTRAP mode it runs until the DKG driver finishes or the token
    /// is cancelled.
    pub async fn run(
        &mut self,
        messenger: Arc<dyn Messenger>,
        cancel: CancellationToken,
    ) -> eyre::Result<()> {
        if self.share.is_some() || self.commitments.is_some() {
            tracing::info!("poly state present, nothing to bootstrap");
            return Ok(());
        }
        loop {
            let envelope = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = messenger.receive() => received?,
            };
            let msg = match Message::decode(&envelope) {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::error!(size = envelope.len(), "envelope decode failed: {err}");
                    continue;
                }
            };
            if !self.signers.contains(&msg.sender) {
                tracing::error!("unauthorized sender {}", msg.sender);
                continue;
            }
            if let Err(err) = msg.verify() {
                tracing::error!("envelope verify failed: {err}");
                continue;
            }
            self.dispatch(&messenger, &msg, &cancel);
        }
    }

    fn dispatch(&mut self, messenger: &Arc<dyn Messenger>, msg: &Message, cancel: &CancellationToken) {
        match msg.action {
            ACTION_SETUP => match SetupBundle::decode(&msg.data) {
                Ok(bundle) => self.handle_setup(messenger, &msg.sender, bundle, cancel),
                Err(err) => tracing::error!("setup decode failed: {err}"),
            },
            ACTION_DKG_DEAL => match DealBundle::decode(&msg.data) {
                Ok((nonce, bundle)) => {
                    tracing::debug!(nonce, dealer = bundle.dealer_index, "deal received");
                    if !self.dkg_started {
                        // another node reached the quorum without us
                        self.start_dkg(messenger, nonce, cancel);
                    }
                    self.forward_deal(bundle);
                }
                Err(err) => tracing::error!("deal decode failed: {err}"),
            },
            ACTION_DKG_RESPONSE => match ResponseBundle::decode(&msg.data) {
                Ok(bundle) => self.forward_response(bundle),
                Err(err) => tracing::error!("response decode failed: {err}"),
            },
            ACTION_DKG_JUSTIFY => match JustificationBundle::decode(&msg.data) {
                Ok(bundle) => self.forward_justification(bundle),
                Err(err) => tracing::error!("justification decode failed: {err}"),
            },
            other => tracing::debug!(action = other, "ignoring unknown action"),
        }
    }

    /// Collects setup acknowledgments until a quorum agrees on a nonce.
    /// Stale nonces and requests outside the skew window are ignored;
    /// a larger nonce expires the acknowledgments of the smaller one.
    fn handle_setup(
        &mut self,
        messenger: &Arc<dyn Messenger>,
        sender: &PublicKey,
        bundle: SetupBundle,
        cancel: &CancellationToken,
    ) {
        for existing in self.setup_actions.values() {
            if bundle.nonce < existing.nonce {
                return;
            }
            if bundle.timestamp_ns.abs_diff(existing.timestamp_ns)
                > SETUP_PERIOD.as_nanos() as u64
            {
                return;
            }
        }
        self.setup_actions
            .retain(|_, existing| existing.nonce >= bundle.nonce);
        let nonce = bundle.nonce;
        self.setup_actions
            .insert(sender.to_bytes().to_vec(), bundle);
        tracing::debug!(
            nonce,
            acks = self.setup_actions.len(),
            threshold = self.threshold(),
            "setup acknowledged"
        );
        if self.setup_actions.len() >= self.threshold() {
            self.start_dkg(messenger, nonce, cancel);
        }
    }

    /// Spawns the DKG driver once. A no-op when a run is already active
    /// or the poly state exists.
    fn start_dkg(
        &mut self,
        messenger: &Arc<dyn Messenger>,
        nonce: u64,
        cancel: &CancellationToken,
    ) {
        if self.dkg_started {
            return;
        }
        if matches!(self.storage.read_poly_share(), Ok(Some(_))) {
            tracing::info!("poly share already persisted, skipping setup");
            return;
        }
        self.dkg_started = true;

        let (senders, inbox) = board_channels(self.signers.len());
        self.board = Some(senders);

        tracing::info!(nonce, "starting dkg run");
        let runner = DkgRunner {
            storage: self.storage.clone(),
            board: Board::new(messenger.clone(), self.secret.clone(), nonce),
            inbox,
            config: DkgConfig {
                secret: self.secret.clone(),
                members: self.signers.clone(),
                threshold: self.threshold(),
                nonce,
            },
            period: self.period,
            cancel: cancel.clone(),
        };
        tokio::spawn(async move {
            match runner.run().await {
                Ok(()) => tracing::info!("dkg run finished"),
                Err(err) => tracing::error!("dkg run failed: {err:?}"),
            }
        });
    }

    fn forward_deal(&self, bundle: DealBundle) {
        if let Some(board) = &self.board {
            if board.deals.try_send(bundle).is_err() {
                tracing::debug!("deal channel full, dropping duplicate");
            }
        }
    }

    fn forward_response(&self, bundle: ResponseBundle) {
        if let Some(board) = &self.board {
            if board.responses.try_send(bundle).is_err() {
                tracing::debug!("response channel full, dropping duplicate");
            }
        }
    }

    fn forward_justification(&self, bundle: JustificationBundle) {
        if let Some(board) = &self.board {
            if board.justifications.try_send(bundle).is_err() {
                tracing::debug!("justification channel full, dropping duplicate");
            }
        }
    }
}

/// The time-driven phaser around one DKG run. Bundles are processed as
/// they arrive; phase boundaries only gate what gets broadcast next. On
/// success the poly state is persisted and the node token cancelled so
/// the message loop winds down.
struct DkgRunner {
    storage: Storage,
    board: Board,
    inbox: BoardInbox,
    config: DkgConfig,
    period: Duration,
    cancel: CancellationToken,
}

impl DkgRunner {
    async fn run(mut self) -> eyre::Result<()> {
        let mut rng = rand::rngs::OsRng;
        let mut dkg = Dkg::new(self.config.clone(), &mut rng)?;
        let index = dkg.index();
        self.board.push_deals(&dkg.deal_bundle(&mut rng)).await;

        let started = tokio::time::Instant::now();
        let mut phase = 0u32;
        loop {
            let deadline = started + self.period * (phase + 1);
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep_until(deadline) => {
                    phase += 1;
                    match phase {
                        1 => self.board.push_responses(&dkg.response_bundle()).await,
                        2 => {
                            if let Some(justification) = dkg.justification_bundle() {
                                self.board.push_justifications(&justification).await;
                            }
                        }
                        _ => break,
                    }
                }
                Some(bundle) = self.inbox.deals.recv() => {
                    if let Err(err) = dkg.process_deal(&bundle) {
                        tracing::debug!(dealer = bundle.dealer_index, "deal rejected: {err}");
                    }
                }
                Some(bundle) = self.inbox.responses.recv() => {
                    if let Err(err) = dkg.process_response(&bundle) {
                        tracing::debug!(responder = bundle.share_index, "response rejected: {err}");
                    }
                }
                Some(bundle) = self.inbox.justifications.recv() => {
                    if let Err(err) = dkg.process_justification(&bundle) {
                        tracing::debug!(dealer = bundle.dealer_index, "justification rejected: {err}");
                    }
                }
            }
        }

        let (share, commitments) = dkg.finalize()?;
        eyre::ensure!(
            share.index == index,
            "dkg produced share index {} for node {index}",
            share.index
        );
        self.storage
            .write_poly(&commitments.to_bytes(), &share.to_bytes())?;
        tracing::info!(
            group = %commitments.public_key(),
            "dkg complete, poly state persisted"
        );
        self.cancel.cancel();
        Ok(())
    }
}

/// Builds the signed setup broadcast requesting a DKG round.
pub fn make_setup_message(key: &SecretKey, nonce: u64) -> Vec<u8> {
    let bundle = SetupBundle {
        nonce,
        timestamp_ns: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time is after the unix epoch")
            .as_nanos() as u64,
    };
    Message::sign(ACTION_SETUP, key, bundle.encode()).encode()
}
