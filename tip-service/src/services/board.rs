//! The board bridges the DKG engine to the broadcast bus.
//!
//! Outbound, it wraps bundles into signed [`Message`] envelopes and
//! broadcasts them once. Inbound, the node's message loop feeds decoded
//! bundles into three bounded channels (capacity = group size) that the
//! DKG driver drains. The board holds cloned handles only (key, nonce and
//! bus), never a reference back to the node.

use std::sync::Arc;

use tip_core::SecretKey;
use tip_core::dkg::{DealBundle, JustificationBundle, ResponseBundle};
use tip_core::message::{
    ACTION_DKG_DEAL, ACTION_DKG_JUSTIFY, ACTION_DKG_RESPONSE, Message,
};
use tokio::sync::mpsc;

use crate::services::messenger::Messenger;

/// Outbound half: signs and broadcasts bundles.
pub(crate) struct Board {
    messenger: Arc<dyn Messenger>,
    secret: SecretKey,
    nonce: u64,
}

/// Senders filled by the node's message loop.
pub(crate) struct BoardSenders {
    pub deals: mpsc::Sender<DealBundle>,
    pub responses: mpsc::Sender<ResponseBundle>,
    pub justifications: mpsc::Sender<JustificationBundle>,
}

/// Receivers drained by the DKG driver.
pub(crate) struct BoardInbox {
    pub deals: mpsc::Receiver<DealBundle>,
    pub responses: mpsc::Receiver<ResponseBundle>,
    pub justifications: mpsc::Receiver<JustificationBundle>,
}

/// Creates the three bounded phase channels.
pub(crate) fn board_channels(capacity: usize) -> (BoardSenders, BoardInbox) {
    let (deals_tx, deals_rx) = mpsc::channel(capacity);
    let (responses_tx, responses_rx) = mpsc::channel(capacity);
    let (justifications_tx, justifications_rx) = mpsc::channel(capacity);
    (
        BoardSenders {
            deals: deals_tx,
            responses: responses_tx,
            justifications: justifications_tx,
        },
        BoardInbox {
            deals: deals_rx,
            responses: responses_rx,
            justifications: justifications_rx,
        },
    )
}

impl Board {
    pub(crate) fn new(messenger: Arc<dyn Messenger>, secret: SecretKey, nonce: u64) -> Self {
        Self {
            messenger,
            secret,
            nonce,
        }
    }

    pub(crate) async fn push_deals(&self, bundle: &DealBundle) {
        self.publish(ACTION_DKG_DEAL, bundle.encode(self.nonce)).await;
    }

    pub(crate) async fn push_responses(&self, bundle: &ResponseBundle) {
        self.publish(ACTION_DKG_RESPONSE, bundle.encode()).await;
    }

    pub(crate) async fn push_justifications(&self, bundle: &JustificationBundle) {
        self.publish(ACTION_DKG_JUSTIFY, bundle.encode()).await;
    }

    async fn publish(&self, action: u32, data: Vec<u8>) {
        let envelope = Message::sign(action, &self.secret, data).encode();
        let size = envelope.len();
        match self.messenger.broadcast(envelope).await {
            Ok(()) => tracing::debug!(action, size, "bundle broadcast"),
            Err(err) => tracing::error!(action, "bundle broadcast failed: {err:?}"),
        }
    }
}
