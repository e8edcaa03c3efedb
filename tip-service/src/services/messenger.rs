//! The broadcast bus abstraction.
//!
//! The DKG rides on an external authenticated ordered broadcast channel;
//! the node only needs [`Messenger`]. Two implementations are provided:
//! [`MemoryBus`] wires several in-process nodes together for tests and
//! local setups, and [`RelayMessenger`] talks to an HTTP message relay.
//! Every sender receives its own broadcasts back, which the DKG engine
//! relies on to process its own bundles uniformly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};

/// An authenticated ordered broadcast channel carrying opaque envelope
/// bytes.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Broadcasts one envelope to every connected node, including the
    /// sender.
    async fn broadcast(&self, data: Vec<u8>) -> eyre::Result<()>;
    /// Waits for the next envelope.
    async fn receive(&self) -> eyre::Result<Vec<u8>>;
}

/// An in-process bus connecting the nodes of one test or local cluster.
pub struct MemoryBus {
    tx: broadcast::Sender<Vec<u8>>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attaches one node to the bus.
    pub fn connect(&self) -> MemoryMessenger {
        MemoryMessenger {
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
        }
    }
}

/// One node's handle onto a [`MemoryBus`].
pub struct MemoryMessenger {
    tx: broadcast::Sender<Vec<u8>>,
    rx: Mutex<broadcast::Receiver<Vec<u8>>>,
}

#[async_trait]
impl Messenger for MemoryMessenger {
    async fn broadcast(&self, data: Vec<u8>) -> eyre::Result<()> {
        self.tx
            .send(data)
            .map_err(|_| eyre::eyre!("no receivers left on the bus"))?;
        Ok(())
    }

    async fn receive(&self) -> eyre::Result<Vec<u8>> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(data) => return Ok(data),
                // a slow consumer skipped some messages; the protocols
                // tolerate loss, keep draining
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "memory bus receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    eyre::bail!("memory bus closed")
                }
            }
        }
    }
}

#[derive(Serialize)]
struct RelayPost {
    payload: String,
}

#[derive(Deserialize)]
struct RelayPoll {
    messages: Vec<String>,
    next: u64,
}

/// Client of an HTTP message relay: `POST /messages` to broadcast,
/// `GET /messages?after=N` to poll in order.
pub struct RelayMessenger {
    client: reqwest::Client,
    url: String,
    cursor: AtomicU64,
    queue: Mutex<Vec<Vec<u8>>>,
    poll_interval: Duration,
}

impl RelayMessenger {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
            cursor: AtomicU64::new(0),
            queue: Mutex::new(Vec::new()),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl Messenger for RelayMessenger {
    async fn broadcast(&self, data: Vec<u8>) -> eyre::Result<()> {
        let response = self
            .client
            .post(format!("{}/messages", self.url))
            .json(&RelayPost {
                payload: URL_SAFE_NO_PAD.encode(&data),
            })
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            eyre::bail!("relay rejected broadcast with {}", response.status());
        }
        Ok(())
    }

    async fn receive(&self) -> eyre::Result<Vec<u8>> {
        {
            let mut queue = self.queue.lock().await;
            if !queue.is_empty() {
                return Ok(queue.remove(0));
            }
        }
        loop {
            let after = self.cursor.load(Ordering::Acquire);
            let poll: RelayPoll = self
                .client
                .get(format!("{}/messages", self.url))
                .query(&[("after", after)])
                .timeout(Duration::from_secs(10))
                .send()
                .await?
                .json()
                .await?;
            self.cursor.store(poll.next, Ordering::Release);
            if poll.messages.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }
            let mut decoded = poll
                .messages
                .iter()
                .filter_map(|message| URL_SAFE_NO_PAD.decode(message).ok())
                .collect::<Vec<_>>();
            let first = decoded.remove(0);
            if !decoded.is_empty() {
                self.queue.lock().await.append(&mut decoded);
            }
            return Ok(first);
        }
    }
}
