// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Lattice Node
//!
//! Entry point for the `lattice-node` binary. Parses CLI arguments, sets up
//! logging, joins the lattice over TCP and serves the status API.
//!
//! - `run`: start a node
//! - `keygen`: generate an identity key
//! - `demo`: run a three-node lattice in one process
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::{json, Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

use lattice_protocol::config::{PROTOCOL_VERSION, SIGNING_ALGORITHM};
use lattice_protocol::{
    AcknowledgeHandler, CorrectionHandler, CorrectionModel, Directive, LatticeConfig,
    LatticeError, LatticeKeypair, LatticeNode, LocalBus, NodeRole, TcpTransport,
};

use cli::{Commands, DemoArgs, KeygenArgs, LatticeNodeCli, RunArgs};
use logging::{LogFormat, DEFAULT_FILTER};
use metrics::LatticeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = LatticeNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Keygen(args) => keygen(args),
        Commands::Demo(args) => run_demo(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Joins the lattice over TCP and serves `/health`, `/status`, `/metrics`
/// until SIGINT or SIGTERM.
async fn run_node(args: RunArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, LogFormat::from_str_lossy(&args.log_format));

    let config = args.node_config()?;
    let keypair = load_keypair(&args)?;
    let peers = args.peer_addrs()?;
    let trusted = args.trusted_keys()?;

    let transport = TcpTransport::bind(config.node_id.clone(), args.listen)
        .await
        .with_context(|| format!("failed to bind lattice listener on {}", args.listen))?;
    for (id, addr) in peers {
        transport.add_peer(id, addr);
    }

    let node = Arc::new(LatticeNode::with_keypair(config, keypair, transport.clone())?);
    for (id, key) in trusted {
        node.trust(&id, key)?;
    }
    node.register_directive_handler("ping", AcknowledgeHandler);

    tracing::info!(
        node_id = %node.node_id(),
        role = %node.config().role,
        listen = %transport.local_addr(),
        peers = ?transport.peers(),
        public_key = %node.public_key(),
        "starting lattice-node"
    );
    node.start().await?;

    let metrics = Arc::new(LatticeMetrics::new().context("failed to create metrics registry")?);
    let router = api::create_router(api::AppState {
        version: format!("{} (protocol {})", env!("CARGO_PKG_VERSION"), PROTOCOL_VERSION),
        node: Arc::clone(&node),
        metrics,
    });
    let api_addr = SocketAddr::from(([0, 0, 0, 0], args.api_port));
    let listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("status API listening on {}", api_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    tracing::info!("shutdown signal received, stopping node");
    node.stop().await?;
    transport.close();
    tracing::info!("lattice-node stopped");
    Ok(())
}

fn load_keypair(args: &RunArgs) -> Result<LatticeKeypair> {
    if let Some(hex) = &args.key {
        return LatticeKeypair::from_secret_hex(hex.trim()).context("invalid --key");
    }
    if let Some(path) = &args.key_file {
        let hex = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read key file {}", path.display()))?;
        return LatticeKeypair::from_secret_hex(hex.trim())
            .with_context(|| format!("invalid key in {}", path.display()));
    }
    tracing::warn!("no identity key given, generating an ephemeral one");
    Ok(LatticeKeypair::generate())
}

/// Prints the public key, and the secret key unless it went to `--output`.
fn keygen(args: KeygenArgs) -> Result<()> {
    let keypair = LatticeKeypair::generate();
    let public_key = keypair.public_key().to_hex();

    let out = match &args.output {
        Some(path) => {
            std::fs::write(path, keypair.secret_key_hex())
                .with_context(|| format!("failed to write key file {}", path.display()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                    .with_context(|| format!("failed to restrict {}", path.display()))?;
            }
            json!({ "public_key": public_key, "key_file": path.display().to_string() })
        }
        None => json!({ "public_key": public_key, "secret_key": keypair.secret_key_hex() }),
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// Echoes the directive parameters back as the correction.
struct ParameterEcho;

impl CorrectionModel for ParameterEcho {
    fn correct(&self, directive: &Directive) -> lattice_protocol::Result<Map<String, Value>> {
        let mut correction = directive.parameters.clone();
        correction.insert("corrected".into(), Value::Bool(true));
        Ok(correction)
    }
}

/// `a ─ b ─ c` on an in-process bus, with `b` as router. `a` cannot reach
/// `c` directly, so every directive is forwarded through `b`.
async fn run_demo(args: DemoArgs) -> Result<()> {
    logging::init_logging(DEFAULT_FILTER, LogFormat::from_str_lossy(&args.log_format));

    let bus = LocalBus::new();
    bus.link("a", "b");
    bus.link("b", "c");

    let mut nodes = Vec::new();
    for (id, role) in [("a", NodeRole::Core), ("b", NodeRole::Router), ("c", NodeRole::Vitality)] {
        let config = LatticeConfig::for_node(id, role);
        nodes.push(LatticeNode::new(config, bus.transport(id))?);
    }
    for x in &nodes {
        for y in &nodes {
            if x.node_id() != y.node_id() {
                x.trust(y.node_id(), y.public_key())?;
            }
        }
    }
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    c.register_directive_handler("ping", AcknowledgeHandler);
    c.register_directive_handler("correct", CorrectionHandler::new(ParameterEcho));

    for node in &nodes {
        node.start().await?;
    }
    for node in &nodes {
        node.discovery_tick().await;
    }
    for node in &nodes {
        node.gossip_tick().await;
    }
    b.routing_tick().await;

    for i in 0..args.directives {
        let directive = if i % 2 == 0 {
            Directive::new("ping")
        } else {
            Directive::new("correct").with_parameter("sample", json!(i))
        }
        .with_timeout(5.0);
        let command = directive.command.clone();
        match a.request(directive, c.node_id()).await {
            Ok(response) => println!(
                "{}",
                serde_json::to_string_pretty(&json!({ "command": command, "response": response }))?
            ),
            Err(e @ LatticeError::Timeout { .. }) => {
                tracing::warn!(command = %command, error = %e, "directive went unanswered")
            }
            Err(e) => return Err(e).context("demo directive failed"),
        }
    }

    println!("{}", serde_json::to_string_pretty(&b.network_topology())?);
    tracing::info!(forwarded = b.status().stats.forwarded, "demo finished");

    for node in &nodes {
        node.stop().await?;
    }
    Ok(())
}

fn print_version() {
    println!("lattice-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol     {}", PROTOCOL_VERSION);
    println!("signing      {}", SIGNING_ALGORITHM);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. A handler that cannot be
/// installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
