//! Node configuration.
//!
//! Every option can be set via command line arguments or environment
//! variables using `clap`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Identity and group settings of the signer node.
#[derive(Parser, Debug, Clone)]
pub struct NodeConfig {
    /// Hex encoded BN254 scalar used as the node's long-term key.
    #[clap(long = "node-key", env = "TIP_NODE_KEY", hide_env_values = true)]
    pub key: String,

    /// Base58-check identities of the full signer group, comma separated.
    #[clap(
        long = "node-signers",
        env = "TIP_NODE_SIGNERS",
        value_delimiter = ','
    )]
    pub signers: Vec<String>,

    /// Length of one DKG phase.
    #[clap(
        long = "node-timeout",
        env = "TIP_NODE_TIMEOUT",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    pub timeout: Duration,
}

/// Location of the node state.
#[derive(Parser, Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the state database.
    #[clap(long = "store-dir", env = "TIP_STORE_DIR")]
    pub dir: PathBuf,
}

/// HTTP API settings.
#[derive(Parser, Debug, Clone)]
pub struct ApiConfig {
    /// The bind address of the axum server.
    #[clap(
        long = "api-bind-addr",
        env = "TIP_API_BIND_ADDR",
        default_value = "0.0.0.0:7080"
    )]
    pub bind_addr: SocketAddr,

    /// Max accepted request body size in bytes.
    #[clap(
        long = "api-max-body-limit",
        env = "TIP_API_MAX_BODY_LIMIT",
        default_value = "32768"
    )]
    pub max_body_limit: usize,
}

/// Broadcast bus settings.
#[derive(Parser, Debug, Clone)]
pub struct MessengerConfig {
    /// Base URL of the HTTP message relay carrying DKG broadcasts.
    #[clap(long = "messenger-url", env = "TIP_MESSENGER_URL")]
    pub url: String,
}
