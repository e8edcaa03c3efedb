//! TIP signer node service.
//!
//! A node plays two roles over one state directory:
//!
//! - the **signer** role consumes the broadcast bus until a DKG run has
//!   produced this node's poly share ([`SignerNode`]),
//! - the **api** role serves the HTTP surface: keeper-guarded partial
//!   signing and watcher lookups ([`start`]).
//!
//! The keeper ([`services::keeper`]) is where security lives; everything
//! else arranges state around it.

use std::future::Future;

use axum::Router;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use tip_core::{Commitments, PrivateShare, PublicKey, SecretKey};
use tip_store::Storage;

pub(crate) mod api;
pub mod config;
pub mod metrics;
pub mod services;
pub mod telemetry;

pub use services::keeper::KeeperService;
pub use services::messenger::{MemoryBus, Messenger, RelayMessenger};
pub use services::signer::{SignerNode, make_setup_message, quorum};

/// Returns the cargo package name and version of this build.
pub fn version_info() -> String {
    format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) keeper: KeeperService,
    pub(crate) storage: Storage,
    pub(crate) secret: SecretKey,
    pub(crate) identity: PublicKey,
    pub(crate) signers: Vec<PublicKey>,
    pub(crate) share: Option<PrivateShare>,
    pub(crate) commitments: Option<Commitments>,
}

impl AppState {
    fn from_node(storage: Storage, node: &SignerNode) -> Self {
        Self {
            keeper: KeeperService::new(storage.clone(), node.secret().clone()),
            storage,
            secret: node.secret().clone(),
            identity: *node.identity(),
            signers: node.signers().to_vec(),
            share: node.share().cloned(),
            commitments: node.commitments().cloned(),
        }
    }
}

pub(crate) fn build_router(storage: Storage, node: &SignerNode, max_body_limit: usize) -> Router {
    api::new_app(AppState::from_node(storage, node), max_body_limit)
}

/// Runs the HTTP API until the shutdown signal fires.
pub async fn start(
    storage: Storage,
    node: &SignerNode,
    config: config::ApiConfig,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> eyre::Result<()> {
    let app = build_router(storage, node, config.max_body_limit);
    let cancellation_token = spawn_shutdown_task(shutdown_signal);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("starting axum server on {}", listener.local_addr()?);
    let token = cancellation_token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    tracing::info!("axum server shutdown");
    Ok(())
}

/// Spawns a task bridging an external shutdown future into a
/// [`CancellationToken`]. The token also fires when some internal task
/// cancels it directly; waiting on the token is the preferred way to wait
/// for termination.
pub fn spawn_shutdown_task(
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> CancellationToken {
    let cancellation_token = CancellationToken::new();
    let task_token = cancellation_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal => {
                tracing::info!("received external shutdown");
                task_token.cancel();
            }
            _ = task_token.cancelled() => {
                tracing::info!("received internal shutdown");
            }
        }
    });
    cancellation_token
}

/// The default shutdown signal: Ctrl+C or SIGTERM.
pub async fn default_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum_test::TestServer;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use rand::RngCore;
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use tip_core::dkg::{Dkg, DkgConfig};
    use tip_core::threshold::PARTIAL_SIZE;
    use tip_core::{
        Commitments, PartialSignature, PrivateShare, PublicKey, SecretKey, hybrid, threshold,
    };
    use tip_store::Storage;

    use crate::config::NodeConfig;
    use crate::services::keeper::{
        EPHEMERAL_GRACE, EPHEMERAL_LIMIT_QUOTA, EPHEMERAL_LIMIT_WINDOW, KeeperService,
        SECRET_LIMIT_QUOTA,
    };
    use crate::services::messenger::{MemoryBus, Messenger as _};
    use crate::services::signer::{SignerNode, make_setup_message};
    use crate::{AppState, api};

    /// Runs a complete DKG synchronously across `keys`, returning every
    /// node's share and the shared commitments.
    fn run_test_dkg(
        keys: &[SecretKey],
        members: &[PublicKey],
        threshold: usize,
    ) -> Vec<(PrivateShare, Commitments)> {
        let mut rng = rand::rngs::OsRng;
        let mut nodes: Vec<Dkg> = keys
            .iter()
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
            .collect();
        let deals: Vec<_> = nodes.iter().map(|node| node.deal_bundle(&mut rng)).collect();
        for node in nodes.iter_mut() {
            for deal in &deals {
                node.process_deal(deal).unwrap();
            }
        }
        let responses: Vec<_> = nodes.iter().map(|node| node.response_bundle()).collect();
        for node in nodes.iter_mut() {
            for response in &responses {
                node.process_response(response).unwrap();
            }
        }
        nodes
            .into_iter()
            .map(|node| node.finalize().unwrap())
            .collect()
    }

    fn sorted_keys(n: usize) -> (Vec<SecretKey>, Vec<PublicKey>) {
        let mut rng = rand::thread_rng();
        let mut keys: Vec<SecretKey> = (0..n).map(|_| SecretKey::random(&mut rng)).collect();
        keys.sort_by_key(|key| key.public().to_base58());
        let members = keys.iter().map(|key| key.public()).collect();
        (keys, members)
    }

    struct TestSetup {
        server: TestServer,
        storage: Storage,
        node_public: PublicKey,
        commitments: Commitments,
        _dir: TempDir,
    }

    impl TestSetup {
        /// A single serving node with a 1-of-1 sharing.
        fn new() -> Self {
            let (keys, members) = sorted_keys(1);
            let mut outputs = run_test_dkg(&keys, &members, 1);
            let (share, commitments) = outputs.remove(0);

            let dir = tempfile::tempdir().unwrap();
            let storage = Storage::open(dir.path()).unwrap();
            storage
                .write_poly(&commitments.to_bytes(), &share.to_bytes())
                .unwrap();

            let secret = keys.into_iter().next().unwrap();
            let node_public = members[0];
            let state = AppState {
                keeper: KeeperService::new(storage.clone(), secret.clone()),
                storage: storage.clone(),
                secret,
                identity: node_public,
                signers: members,
                share: Some(share),
                commitments: Some(commitments.clone()),
            };
            Self {
                server: api::new_test_app(state),
                storage,
                node_public,
                commitments,
                _dir: dir,
            }
        }

        /// The node's long-term identity, target of request encryption.
        fn node_identity(&self) -> PublicKey {
            self.node_public
        }
    }

    struct UserSession {
        key: SecretKey,
        ephemeral: Vec<u8>,
        watcher: String,
    }

    impl UserSession {
        fn new() -> Self {
            let mut rng = rand::thread_rng();
            let mut watcher = [0u8; 32];
            rng.fill_bytes(&mut watcher);
            Self {
                key: SecretKey::random(&mut rng),
                ephemeral: {
                    let bytes = SecretKey::random(&mut rng).to_bytes();
                    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
                    bytes[first..].to_vec()
                },
                watcher: hex::encode(watcher),
            }
        }

        /// A well-formed SIGN body towards `node`, optionally with a
        /// broken outer signature.
        fn request(&self, node: &PublicKey, nonce: u64, valid_signature: bool) -> Value {
            let mut rng = rand::thread_rng();
            let public = self.key.public();
            let grace = EPHEMERAL_GRACE.as_nanos() as u64;

            let mut msg = public.to_bytes().to_vec();
            msg.extend_from_slice(&self.ephemeral);
            msg.extend_from_slice(&nonce.to_be_bytes());
            msg.extend_from_slice(&grace.to_be_bytes());

            let body = json!({
                "identity": public.to_base58(),
                "ephemeral": hex::encode(&self.ephemeral),
                "nonce": nonce,
                "grace": grace,
                "watcher": self.watcher,
            });
            let cipher = hybrid::encrypt(
                &mut rng,
                &self.key,
                node,
                &serde_json::to_vec(&body).unwrap(),
            );
            let signature = if valid_signature {
                self.key.sign(&msg)
            } else {
                self.key.sign(b"broken")
            };
            json!({
                "action": "SIGN",
                "identity": public.to_base58(),
                "signature": signature.to_hex(),
                "data": URL_SAFE_NO_PAD.encode(cipher),
                "watcher": self.watcher,
            })
        }
    }

    #[tokio::test]
    async fn info_is_signed_by_the_node() {
        let setup = TestSetup::new();
        let value: Value = setup.server.get("/").await.json();

        let data = value.get("data").unwrap();
        assert_eq!(
            data["identity"].as_str().unwrap(),
            setup.node_identity().to_base58()
        );
        assert_eq!(data["signers"].as_array().unwrap().len(), 1);
        assert_eq!(data["commitments"].as_array().unwrap().len(), 1);

        let payload = serde_json::to_vec(data).unwrap();
        let signature =
            tip_core::Signature::from_hex(value["signature"].as_str().unwrap()).unwrap();
        setup
            .node_identity()
            .verify(&payload, &signature)
            .unwrap();
    }

    #[tokio::test]
    async fn sign_round_trip_produces_a_verifiable_partial() {
        let setup = TestSetup::new();
        let user = UserSession::new();
        let node = setup.node_identity();

        let value: Value = setup
            .server
            .post("/")
            .json(&user.request(&node, 1024, true))
            .await
            .json();

        let cipher = hex::decode(value["data"]["cipher"].as_str().unwrap()).unwrap();
        let plain = hybrid::decrypt(&user.key, &node, &cipher).unwrap();
        assert_eq!(plain.len(), 8 + PARTIAL_SIZE + 128 + 8 + 8);

        let nonce = u64::from_be_bytes(plain[..8].try_into().unwrap());
        assert_eq!(nonce, 1024);
        let partial = PartialSignature::from_bytes(&plain[8..8 + PARTIAL_SIZE]).unwrap();
        let assignor = &plain[8 + PARTIAL_SIZE..8 + PARTIAL_SIZE + 128];
        assert_eq!(assignor, user.key.public().to_bytes());
        let counter = u64::from_be_bytes(plain[plain.len() - 8..].try_into().unwrap());
        assert_eq!(counter, 1);

        setup.commitments.verify_partial(assignor, &partial).unwrap();
        let signature =
            threshold::recover(&setup.commitments, assignor, &[partial], 1, 1).unwrap();
        setup
            .commitments
            .public_key()
            .verify(assignor, &signature)
            .unwrap();

        // the watcher observes the recorded sign
        let watch: Value = setup
            .server
            .post("/")
            .json(&json!({"action": "WATCH", "watcher": user.watcher}))
            .await
            .json();
        assert_eq!(watch["data"]["counter"].as_u64().unwrap(), 1);
        assert!(watch["data"]["genesis"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn replayed_nonce_is_rejected_and_punished() {
        let setup = TestSetup::new();
        let user = UserSession::new();
        let node = setup.node_identity();

        setup
            .server
            .post("/")
            .json(&user.request(&node, 1024, true))
            .await
            .assert_status_ok();

        let response = setup
            .server
            .post("/")
            .json(&user.request(&node, 1024, true))
            .expect_failure()
            .await;
        response.assert_status_bad_request();
        let value: Value = response.json();
        assert_eq!(value["error"]["code"].as_u64().unwrap(), 400);
        assert_eq!(
            value["error"]["description"].as_str().unwrap(),
            "invalid ephemeral"
        );

        let mut limit_key = user.key.public().to_bytes().to_vec();
        limit_key.extend_from_slice(b"EPHEMERAL");
        let available = setup
            .storage
            .check_limit(
                &limit_key,
                EPHEMERAL_LIMIT_WINDOW,
                EPHEMERAL_LIMIT_QUOTA,
                false,
            )
            .unwrap();
        assert_eq!(available, EPHEMERAL_LIMIT_QUOTA - 1);
    }

    #[tokio::test]
    async fn exhausted_secret_bucket_yields_429() {
        let setup = TestSetup::new();
        let user = UserSession::new();
        let node = setup.node_identity();

        for i in 0..SECRET_LIMIT_QUOTA as u64 {
            setup
                .server
                .post("/")
                .json(&user.request(&node, 1024 + i, false))
                .expect_failure()
                .await
                .assert_status_bad_request();
        }
        let response = setup
            .server
            .post("/")
            .json(&user.request(&node, 2048, true))
            .expect_failure()
            .await;
        assert_eq!(response.status_code().as_u16(), 429);
    }

    #[tokio::test]
    async fn unknown_actions_are_bad_requests() {
        let setup = TestSetup::new();
        setup
            .server
            .post("/")
            .json(&json!({"action": "FROB"}))
            .expect_failure()
            .await
            .assert_status_bad_request();
    }

    #[tokio::test]
    async fn watch_validates_the_key_length() {
        let setup = TestSetup::new();
        setup
            .server
            .post("/")
            .json(&json!({"action": "WATCH", "watcher": "abcd"}))
            .expect_failure()
            .await
            .assert_status_bad_request();

        let value: Value = setup
            .server
            .post("/")
            .json(&json!({"action": "WATCH", "watcher": hex::encode([9u8; 32])}))
            .await
            .json();
        assert_eq!(value["data"]["counter"].as_u64().unwrap(), 0);
        assert_eq!(value["data"]["genesis"].as_u64().unwrap(), 0);
    }

    #[tokio::test]
    async fn mismatched_top_level_watcher_is_rejected() {
        let setup = TestSetup::new();
        let user = UserSession::new();
        let node = setup.node_identity();

        let mut request = user.request(&node, 1024, true);
        request["watcher"] = json!(hex::encode([7u8; 32]));
        setup
            .server
            .post("/")
            .json(&request)
            .expect_failure()
            .await
            .assert_status_bad_request();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn four_nodes_bootstrap_a_group_key_over_the_bus() {
        let bus = MemoryBus::new(256);
        let (keys, members) = sorted_keys(4);
        let names: Vec<String> = members.iter().map(|m| m.to_base58()).collect();

        let mut storages = Vec::new();
        let mut dirs = Vec::new();
        let mut handles = Vec::new();
        for key in &keys {
            let dir = tempfile::tempdir().unwrap();
            let storage = Storage::open(dir.path()).unwrap();
            let config = NodeConfig {
                key: key.to_hex(),
                signers: names.clone(),
                timeout: Duration::from_millis(300),
            };
            let mut node = SignerNode::new(storage.clone(), &config).unwrap();
            let messenger: Arc<dyn crate::Messenger> = Arc::new(bus.connect());
            let token = CancellationToken::new();
            handles.push(tokio::spawn(async move { node.run(messenger, token).await }));
            storages.push(storage);
            dirs.push(dir);
        }

        // a threshold of operators requests the same setup nonce
        let requester = bus.connect();
        for key in keys.iter().take(3) {
            requester
                .broadcast(make_setup_message(key, 1 << 20))
                .await
                .unwrap();
        }

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(15), handle)
                .await
                .expect("node did not finish its bootstrap")
                .unwrap()
                .unwrap();
        }

        let reference = storages[0].read_poly_public().unwrap().unwrap();
        let commitments = Commitments::from_bytes(&reference).unwrap();
        assert_eq!(commitments.threshold(), 3);

        let mut partials = Vec::new();
        for (i, storage) in storages.iter().enumerate() {
            assert_eq!(storage.read_poly_public().unwrap().unwrap(), reference);
            let share =
                PrivateShare::from_bytes(&storage.read_poly_share().unwrap().unwrap()).unwrap();
            assert_eq!(share.index, i as u32);
            partials.push(share.partial_sign(b"pin"));
        }
        let signature =
            threshold::recover(&commitments, b"pin", &partials[..3], 3, 4).unwrap();
        commitments.public_key().verify(b"pin", &signature).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn client_recovers_the_same_pin_across_assignee_rotation() {
        let (keys, members) = sorted_keys(4);
        let outputs = run_test_dkg(&keys, &members, 3);
        let commitments = outputs[0].1.clone();

        let mut servers = Vec::new();
        let mut entries = Vec::new();
        let mut dirs = Vec::new();
        for (key, (share, _)) in keys.iter().zip(&outputs) {
            let dir = tempfile::tempdir().unwrap();
            let storage = Storage::open(dir.path()).unwrap();
            storage
                .write_poly(&commitments.to_bytes(), &share.to_bytes())
                .unwrap();
            let state = AppState {
                keeper: KeeperService::new(storage.clone(), key.clone()),
                storage,
                secret: key.clone(),
                identity: key.public(),
                signers: members.clone(),
                share: Some(share.clone()),
                commitments: Some(commitments.clone()),
            };
            let server = TestServer::builder()
                .http_transport()
                .build(api::new_app(state, 32 * 1024))
                .unwrap();
            entries.push(tip_client::SignerEntry {
                identity: key.public().to_base58(),
                api: server.server_address().unwrap().to_string(),
            });
            servers.push(server);
            dirs.push(dir);
        }

        let config = tip_client::ClientConfig {
            commitments: commitments
                .points()
                .iter()
                .map(|point| point.to_base58())
                .collect(),
            signers: entries,
        };
        let (client, evicted) = tip_client::Client::new(config).await.unwrap();
        assert!(evicted.is_empty());

        let mut rng = rand::thread_rng();
        let user = SecretKey::random(&mut rng);
        let ephemeral = SecretKey::random(&mut rng).to_hex();
        let mut watcher = [0u8; 32];
        rng.fill_bytes(&mut watcher);
        let watcher = hex::encode(watcher);
        let grace = Duration::from_secs(128 * 24 * 60 * 60);

        let (pin, evicted) = client
            .sign(&user.to_hex(), &ephemeral, 1024, grace, None, None, &watcher)
            .await
            .unwrap();
        assert!(evicted.is_empty());
        commitments
            .public_key()
            .verify(&user.public().to_bytes(), &pin)
            .unwrap();

        let observed = client.watch(&watcher).await.unwrap();
        assert_eq!(observed.counter, 1);
        assert!(observed.genesis > 0);

        // rotating the assignee keeps the assignor, so the recovered pin
        // never changes
        let next = SecretKey::random(&mut rng);
        let (rotated_pin, evicted) = client
            .sign(
                &user.to_hex(),
                &ephemeral,
                1025,
                grace,
                None,
                Some(&next.to_hex()),
                &watcher,
            )
            .await
            .unwrap();
        assert!(evicted.is_empty());
        assert_eq!(rotated_pin, pin);

        // the new key signs under the inherited assignor, continuing the
        // assignor's ephemeral and nonce sequence
        let (next_pin, _) = client
            .sign(&next.to_hex(), &ephemeral, 1026, grace, None, None, &watcher)
            .await
            .unwrap();
        assert_eq!(next_pin, pin);
    }
}
