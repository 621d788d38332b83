// UAV authentication daemon: responder, initiator commands, Base Station.

mod config;
mod session;
mod state;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uav_core::{AuthMode, BaseStation, DeviceFunction, Node, PeerStore};

use crate::config::Config;
use crate::session::SessionOptions;

#[derive(Parser, Debug)]
#[command(name = "uav-linux", version, about = "PUF-based mutual authentication for UAV swarms")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer enrollment, authentication, pre-enrollment and introductions.
    Serve,
    /// Mutually enroll with the node at `addr`.
    Enroll { addr: SocketAddr, peer: String },
    /// Authenticate an enrolled node.
    Authenticate {
        addr: SocketAddr,
        peer: String,
        /// Also establish a session key.
        #[arg(long)]
        key: bool,
    },
    /// Pre-enroll a target node, then hand out its credentials on request.
    BaseStation {
        #[arg(long)]
        target: SocketAddr,
        #[arg(long)]
        target_id: String,
    },
    /// Fetch a credential for `target` from the Base Station at `addr`.
    FetchCredential { addr: SocketAddr, target: String },
    /// Introduce this node to `target` using a fetched credential.
    Introduce { addr: SocketAddr, target: String },
    /// Print the stored peer table (without secret values).
    Peers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = config::load();
    cfg.validate().context("invalid configuration")?;
    let opts = SessionOptions {
        timeout: cfg.receive_timeout(),
        mode: if cfg.key_establishment {
            AuthMode::SessionKey
        } else {
            AuthMode::Plain
        },
    };

    match cli.command {
        Command::Serve => {
            let node = Arc::new(Mutex::new(load_node(&cfg)?));
            serve(&cfg, node, opts).await
        }
        Command::Enroll { addr, peer } => {
            let mut node = load_node(&cfg)?;
            let before = node.peers().clone();
            let mut conn = transport::connect(addr, cfg.codec.build()).await?;
            session::enroll(&mut node, &mut conn, &peer, opts).await?;
            save_node(&cfg, &before, &node)?;
            println!("enrolled {}", peer);
            Ok(())
        }
        Command::Authenticate { addr, peer, key } => {
            let mode = if key { AuthMode::SessionKey } else { AuthMode::Plain };
            let mut node = load_node(&cfg)?;
            let before = node.peers().clone();
            let mut conn = transport::connect(addr, cfg.codec.build()).await?;
            let res = session::authenticate(&mut node, &mut conn, &peer, mode, opts).await;
            // Rotation may have happened even on failure.
            save_node(&cfg, &before, &node)?;
            let outcome = res?;
            println!(
                "authenticated {}{}{}",
                outcome.peer,
                if outcome.recovered { " (recovered)" } else { "" },
                if outcome.session_key.is_some() { ", session key established" } else { "" },
            );
            Ok(())
        }
        Command::BaseStation { target, target_id } => base_station(&cfg, target, &target_id, opts).await,
        Command::FetchCredential { addr, target } => {
            let mut node = load_node(&cfg)?;
            let before = node.peers().clone();
            let mut conn = transport::connect(addr, cfg.codec.build()).await?;
            session::fetch_credential(&mut node, &mut conn, &target, opts).await?;
            save_node(&cfg, &before, &node)?;
            println!("credential for {} stored", target);
            Ok(())
        }
        Command::Introduce { addr, target } => {
            let mut node = load_node(&cfg)?;
            let before = node.peers().clone();
            let mut conn = transport::connect(addr, cfg.codec.build()).await?;
            let res = session::introduce(&mut node, &mut conn, &target, opts).await;
            save_node(&cfg, &before, &node)?;
            println!("introduced to {}", res?.peer);
            Ok(())
        }
        Command::Peers => {
            let node = load_node(&cfg)?;
            let mut ids: Vec<_> = node.peers().iter().collect();
            ids.sort_by(|a, b| a.0.cmp(b.0));
            for (id, rec) in ids {
                println!(
                    "{}\tx={} c={} r={} fallback={}",
                    id,
                    rec.x.is_some(),
                    rec.c.is_some(),
                    rec.r.is_some(),
                    rec.has_fallback()
                );
            }
            Ok(())
        }
    }
}

fn device_function(cfg: &Config) -> anyhow::Result<DeviceFunction> {
    match cfg.salt_bytes().context("invalid salt")? {
        Some(salt) => Ok(DeviceFunction::from_salt(salt)),
        None => {
            warn!("no salt configured; stored credentials will not survive a restart");
            Ok(DeviceFunction::generate())
        }
    }
}

fn load_node(cfg: &Config) -> anyhow::Result<Node> {
    let mut node = Node::with_function(cfg.node_id.clone(), device_function(cfg)?);
    if let Some(path) = &cfg.state_path {
        let peers = state::load(path)?;
        info!(node = %cfg.node_id, peers = peers.len(), path = %path.display(), "peer table loaded");
        node = node.with_peers(peers);
    }
    Ok(node)
}

/// Merge this command's changes into the state file; a running `serve` may share it.
fn save_node(cfg: &Config, before: &PeerStore, node: &Node) -> anyhow::Result<()> {
    if let Some(path) = &cfg.state_path {
        state::save_changes(path, before, node.peers())?;
    }
    Ok(())
}

async fn serve(cfg: &Config, node: Arc<Mutex<Node>>, opts: SessionOptions) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("binding port {}", cfg.listen_port))?;
    info!(node = %cfg.node_id, port = cfg.listen_port, codec = ?cfg.codec, "serving");
    let codec = cfg.codec.build();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = transport::accept(&listener, codec.clone()) => {
                let (mut conn, addr) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let node = node.clone();
                let state_path = cfg.state_path.clone();
                tokio::spawn(async move {
                    match session::serve_connection(&node, &mut conn, opts, state_path.as_deref()).await {
                        Ok(served) => info!(%addr, "{}", served),
                        Err(e) => warn!(%addr, error = %e, "run failed"),
                    }
                });
            }
            res = &mut shutdown => {
                res?;
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

async fn base_station(
    cfg: &Config,
    target: SocketAddr,
    target_id: &str,
    opts: SessionOptions,
) -> anyhow::Result<()> {
    let mut bs = BaseStation::with_function(cfg.node_id.clone(), device_function(cfg)?)
        .with_batch_size(cfg.batch_size);
    let codec = cfg.codec.build();
    let mut conn = transport::connect(target, codec.clone())
        .await
        .with_context(|| format!("connecting to {}", target))?;
    let n = session::pre_enroll(&mut bs, &mut conn, target_id, opts).await?;
    info!(target = target_id, pairs = n, "pre-enrollment done");
    drop(conn);

    let bs = Arc::new(Mutex::new(bs));
    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("binding port {}", cfg.listen_port))?;
    info!(bs = %cfg.node_id, port = cfg.listen_port, "serving credential requests");
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            res = transport::accept(&listener, codec.clone()) => {
                let (mut conn, addr) = match res {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let bs = bs.clone();
                tokio::spawn(async move {
                    match session::serve_credential_request(&bs, &mut conn, opts).await {
                        Ok(requester) => info!(%addr, requester = %requester, "credential handed out"),
                        Err(e) => warn!(%addr, error = %e, "credential request failed"),
                    }
                });
            }
            res = &mut shutdown => {
                res?;
                return Ok(());
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
