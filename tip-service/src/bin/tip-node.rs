//! The `tip-node` command line.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use rand::RngCore;
use tip_core::SecretKey;
use tip_service::config::{ApiConfig, MessengerConfig, NodeConfig, StoreConfig};
use tip_service::telemetry::{self, TelemetryConfig};
use tip_service::{
    Messenger, RelayMessenger, SignerNode, default_shutdown_signal, make_setup_message,
    spawn_shutdown_task,
};
use tip_store::Storage;

#[derive(Parser)]
#[command(
    name = "tip-node",
    version,
    about = "TIP (Throttled Identity PIN) is a decentralized key custodian."
)]
struct Cli {
    #[clap(flatten)]
    telemetry: TelemetryConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the signer node until its DKG bootstrap completes.
    Signer {
        #[clap(flatten)]
        node: NodeConfig,
        #[clap(flatten)]
        store: StoreConfig,
        #[clap(flatten)]
        messenger: MessengerConfig,
    },
    /// Run the HTTP API node.
    Api {
        #[clap(flatten)]
        node: NodeConfig,
        #[clap(flatten)]
        store: StoreConfig,
        #[clap(flatten)]
        api: ApiConfig,
    },
    /// Broadcast a DKG setup request to the signer group.
    Setup {
        /// Hex encoded BN254 scalar used as the node's long-term key.
        #[clap(long = "node-key", env = "TIP_NODE_KEY", hide_env_values = true)]
        key: String,
        #[clap(flatten)]
        messenger: MessengerConfig,
        /// The setup nonce; it must match on all other nodes.
        #[clap(long)]
        nonce: u64,
    },
    /// Generate a key pair.
    Key,
    /// Request a threshold signature from the signer group.
    Sign {
        /// Path to the JSON signer-group configuration.
        #[clap(long)]
        config: PathBuf,
        /// Hex encoded identity key.
        #[clap(long)]
        key: String,
        /// Hex encoded ephemeral seed.
        #[clap(long)]
        ephemeral: String,
        /// The request nonce.
        #[clap(long)]
        nonce: u64,
        /// Optional hex encoded ephemeral rotation seed.
        #[clap(long)]
        rotate: Option<String>,
        /// Optional hex encoded assignee key.
        #[clap(long)]
        assignee: Option<String>,
        /// Hex encoded 32-byte watcher key; generated when omitted.
        #[clap(long)]
        watcher: Option<String>,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    telemetry::initialize(&cli.telemetry)?;

    match cli.command {
        Command::Signer {
            node,
            store,
            messenger,
        } => run_signer(node, store, messenger).await,
        Command::Api { node, store, api } => run_api(node, store, api).await,
        Command::Setup {
            key,
            messenger,
            nonce,
        } => request_setup(key, messenger, nonce).await,
        Command::Key => generate_key(),
        Command::Sign {
            config,
            key,
            ephemeral,
            nonce,
            rotate,
            assignee,
            watcher,
        } => request_sign(config, key, ephemeral, nonce, rotate, assignee, watcher).await,
    }
}

async fn run_signer(
    node: NodeConfig,
    store: StoreConfig,
    messenger: MessengerConfig,
) -> eyre::Result<()> {
    let storage = Storage::open(&store.dir)?;
    let messenger: Arc<dyn Messenger> = Arc::new(RelayMessenger::new(&messenger.url));
    let mut signer = SignerNode::new(storage, &node)?;
    let cancel = spawn_shutdown_task(default_shutdown_signal());
    signer.run(messenger, cancel).await
}

async fn run_api(node: NodeConfig, store: StoreConfig, api: ApiConfig) -> eyre::Result<()> {
    let storage = Storage::open(&store.dir)?;
    let signer = SignerNode::new(storage.clone(), &node)?;
    tip_service::start(storage, &signer, api, default_shutdown_signal()).await
}

async fn request_setup(key: String, messenger: MessengerConfig, nonce: u64) -> eyre::Result<()> {
    eyre::ensure!(nonce >= 1024, "nonce too small");
    let key = SecretKey::from_hex(&key).map_err(|err| eyre::eyre!("invalid node key: {err}"))?;
    let msg = make_setup_message(&key, nonce);
    println!("{} {}", hex::encode(&msg), msg.len());
    RelayMessenger::new(&messenger.url).broadcast(msg).await
}

fn generate_key() -> eyre::Result<()> {
    let mut rng = rand::rngs::OsRng;
    let key = SecretKey::random(&mut rng);
    let public = key.public();

    // self check before anything gets printed
    let signature = key.sign(b"tip");
    public
        .verify(b"tip", &signature)
        .map_err(|err| eyre::eyre!("key self check failed: {err}"))?;

    println!("{}", key.to_hex());
    println!("{}", public.to_base58());
    Ok(())
}

async fn request_sign(
    config: PathBuf,
    key: String,
    ephemeral: String,
    nonce: u64,
    rotate: Option<String>,
    assignee: Option<String>,
    watcher: Option<String>,
) -> eyre::Result<()> {
    let raw = std::fs::read_to_string(&config)?;
    let config = tip_client::ClientConfig::from_json(&raw)?;
    let (client, evicted) = tip_client::Client::new(config).await?;
    for signer in &evicted {
        eprintln!("evicted {} {}", signer.identity, signer.api);
    }

    let watcher = watcher.unwrap_or_else(|| {
        let mut seed = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        hex::encode(seed)
    });
    let grace = Duration::from_secs(128 * 24 * 60 * 60);
    let (signature, evicted) = client
        .sign(
            &key,
            &ephemeral,
            nonce,
            grace,
            rotate.as_deref(),
            assignee.as_deref(),
            &watcher,
        )
        .await?;

    println!("watcher: {watcher}");
    println!("signature: {}", signature.to_hex());
    for signer in &evicted {
        eprintln!("evicted {} {}", signer.identity, signer.api);
    }
    Ok(())
}
