//! # CLI Interface
//!
//! Command-line structure for `lattice-node` using `clap` derive, plus the
//! layering of a JSON config file under flag/env overrides.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use lattice_protocol::config::Topology;
use lattice_protocol::{LatticeConfig, LatticePublicKey, NodeRole};

/// Lattice node.
///
/// Joins a lattice of cooperating nodes over TCP, answers directives, routes
/// traffic for peers that cannot see each other and serves a small status
/// and metrics API.
#[derive(Parser, Debug)]
#[command(
    name = "lattice-node",
    about = "Secure peer-to-peer directive messaging node",
    version,
    propagate_version = true
)]
pub struct LatticeNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a node and join the lattice.
    Run(RunArgs),
    /// Generate an Ed25519 identity key.
    Keygen(KeygenArgs),
    /// Run a three-node lattice in-process and send a directive across it.
    Demo(DemoArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// JSON node configuration. Flags below override its fields.
    #[arg(long, short = 'c', env = "LATTICE_CONFIG")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "LATTICE_NODE_ID")]
    pub node_id: Option<String>,

    /// core, vitality, wealth, router or gateway.
    #[arg(long, env = "LATTICE_ROLE")]
    pub role: Option<NodeRole>,

    #[arg(long, env = "LATTICE_LISTEN", default_value = "127.0.0.1:7400")]
    pub listen: SocketAddr,

    /// Directly linked peer, as `node_id=host:port`. Repeatable.
    #[arg(long = "peer", value_name = "ID=ADDR")]
    pub peers: Vec<String>,

    /// Trusted peer key, as `node_id=hex_public_key`. Repeatable.
    #[arg(long = "trust", value_name = "ID=KEY")]
    pub trusted: Vec<String>,

    /// Hub node id; switches the node to star topology.
    #[arg(long, env = "LATTICE_HUB")]
    pub hub: Option<String>,

    /// Reply `refused` to directives without a handler.
    #[arg(long)]
    pub negative_acks: bool,

    /// Hex-encoded Ed25519 secret key. A fresh key is generated when neither
    /// this nor `--key-file` is given.
    #[arg(long, env = "LATTICE_NODE_KEY", conflicts_with = "key_file")]
    pub key: Option<String>,

    /// File holding the hex secret key, as written by `keygen --output`.
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Port for `/health`, `/status` and `/metrics`.
    #[arg(long, env = "LATTICE_API_PORT", default_value_t = 7401)]
    pub api_port: u16,

    /// Log format: pretty or json.
    #[arg(long, env = "LATTICE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

#[derive(Parser, Debug)]
pub struct KeygenArgs {
    /// Write the secret key here instead of printing it.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct DemoArgs {
    /// Directives to send from the first node to the last.
    #[arg(long, default_value_t = 3)]
    pub directives: usize,

    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl RunArgs {
    /// File config (or defaults), then flags on top, then validation.
    pub fn node_config(&self) -> Result<LatticeConfig> {
        let mut config = match &self.config {
            Some(path) => load_config_file(path)?,
            None => LatticeConfig::default(),
        };
        if let Some(id) = &self.node_id {
            config.node_id = id.clone();
        }
        if let Some(role) = self.role {
            config.role = role;
        }
        if let Some(hub) = &self.hub {
            config.topology = Topology::Star;
            config.hub_node = Some(hub.clone());
        }
        if self.negative_acks {
            config.negative_acks = true;
        }
        if config.endpoint.is_empty() {
            config.endpoint = self.listen.to_string();
        }
        config.validate().context("invalid node configuration")?;
        Ok(config)
    }

    pub fn peer_addrs(&self) -> Result<Vec<(String, SocketAddr)>> {
        self.peers.iter().map(|p| parse_peer(p)).collect()
    }

    pub fn trusted_keys(&self) -> Result<Vec<(String, LatticePublicKey)>> {
        self.trusted.iter().map(|t| parse_trusted(t)).collect()
    }
}

pub fn load_config_file(path: &Path) -> Result<LatticeConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn split_pair(raw: &str) -> Result<(&str, &str)> {
    let (id, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected ID=VALUE, got {:?}", raw))?;
    let id = id.trim();
    if id.is_empty() {
        bail!("empty node id in {:?}", raw);
    }
    Ok((id, value.trim()))
}

pub fn parse_peer(raw: &str) -> Result<(String, SocketAddr)> {
    let (id, addr) = split_pair(raw)?;
    let addr = addr
        .parse()
        .with_context(|| format!("bad peer address in {:?}", raw))?;
    Ok((id.to_string(), addr))
}

pub fn parse_trusted(raw: &str) -> Result<(String, LatticePublicKey)> {
    let (id, key) = split_pair(raw)?;
    let key = LatticePublicKey::from_hex(key)
        .with_context(|| format!("bad public key for {:?}", id))?;
    Ok((id.to_string(), key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use lattice_protocol::LatticeKeypair;

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["lattice-node", "run"];
        argv.extend_from_slice(extra);
        match LatticeNodeCli::parse_from(argv).command {
            Commands::Run(args) => args,
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn verify_cli_structure() {
        LatticeNodeCli::command().debug_assert();
    }

    #[test]
    fn peers_parse_as_id_and_address() {
        let (id, addr) = parse_peer("b=127.0.0.1:7500").unwrap();
        assert_eq!(id, "b");
        assert_eq!(addr.port(), 7500);

        assert!(parse_peer("127.0.0.1:7500").is_err());
        assert!(parse_peer("=127.0.0.1:7500").is_err());
        assert!(parse_peer("b=not-an-address").is_err());
    }

    #[test]
    fn trusted_keys_parse_from_hex() {
        let key = LatticeKeypair::generate().public_key();
        let (id, parsed) = parse_trusted(&format!("c={}", key.to_hex())).unwrap();
        assert_eq!(id, "c");
        assert_eq!(parsed, key);
        assert!(parse_trusted("c=zz").is_err());
    }

    #[test]
    fn flags_override_defaults() {
        let args = run_args(&[
            "--node-id",
            "r1",
            "--role",
            "Router",
            "--hub",
            "h",
            "--negative-acks",
            "--peer",
            "h=127.0.0.1:9000",
        ]);
        let config = args.node_config().unwrap();
        assert_eq!(config.node_id, "r1");
        assert_eq!(config.role, NodeRole::Router);
        assert_eq!(config.topology, Topology::Star);
        assert_eq!(config.hub_node.as_deref(), Some("h"));
        assert!(config.negative_acks);
        assert_eq!(config.endpoint, "127.0.0.1:7400");
        assert_eq!(args.peer_addrs().unwrap().len(), 1);
    }

    #[test]
    fn config_file_is_layered_under_flags() {
        let path = std::env::temp_dir().join(format!(
            "lattice-node-config-{}.json",
            std::process::id()
        ));
        std::fs::write(
            &path,
            r#"{"node_id": "from-file", "role": "wealth", "gossip_interval_seconds": 7}"#,
        )
        .unwrap();

        let args = run_args(&["--config", path.to_str().unwrap(), "--node-id", "from-flag"]);
        let config = args.node_config().unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.node_id, "from-flag");
        assert_eq!(config.role, NodeRole::Wealth);
        assert_eq!(config.gossip_interval_seconds, 7);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let args = run_args(&["--node-id", "a/b"]);
        assert!(args.node_config().is_err());
    }
}
