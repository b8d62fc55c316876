//! PeerChat daemon: bootstrap, service discovery and room chat over stdin/stdout.
//!
//! Runs on the in-process fabric with a local lab of companion peers; type lines to chat,
//! `/room <name>`, `/user <name>`, `/peers` and `/quit` to control the session.

mod config;
mod lab;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use peerchat_core::{
    bootstrap_fabric, create_identity, parse_seeds, start_discovery, DiscoveryMode, EventRouter,
    Fabric, MemoryHub, NodeId, RoomSwitcher, ServiceDescriptor, UiEvent, UserInput,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::lab::LocalLab;

/// Serverless peer-to-peer room chat
#[derive(Parser)]
#[command(name = "peerchat", version, about, long_about = None)]
struct Cli {
    /// Display name in the room
    #[arg(short, long)]
    user: Option<String>,

    /// Room to join
    #[arg(short, long)]
    room: Option<String>,

    /// Discovery mode: provide or rendezvous
    #[arg(short, long)]
    mode: Option<DiscoveryMode>,

    /// Listen port (0 picks a free one)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bootstrap peer, `<node id>@<ip:port>` (repeatable)
    #[arg(long = "peer", value_name = "PEER")]
    peers: Vec<String>,

    /// Number of companion peers in the local lab
    #[arg(long)]
    lab_peers: Option<usize>,

    /// Generate the same node ID on every run (derived from the listen port)
    #[arg(long)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(self, c: &mut Config) {
        if let Some(user) = self.user {
            c.user = user;
        }
        if let Some(room) = self.room {
            c.room = room;
        }
        if let Some(mode) = self.mode {
            c.mode = mode;
        }
        if let Some(port) = self.port {
            c.listen_port = port;
        }
        c.seeds.extend(self.peers);
        if let Some(n) = self.lab_peers {
            c.lab_peers = n;
        }
        c.debug |= self.debug;
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut cfg = config::load(cli.config.as_deref())?;
    cli.apply(&mut cfg);

    let rt = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    let res = rt.block_on(run(cfg));
    // stdin reads park a blocking thread that never returns on its own
    rt.shutdown_timeout(Duration::from_millis(100));
    res
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "peerchat=debug,peerchat_core=debug"
    } else {
        "peerchat=info,peerchat_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cfg: Config) -> Result<()> {
    let hub = MemoryHub::new();
    let identity = create_identity(cfg.identity_seed());
    let node = hub
        .spawn_node(identity, cfg.listen_port)
        .context("initializing network engine")?;
    println!("node id: {}", node.local_id());
    for addr in node.listen_addrs() {
        println!("listening on {}@{}", node.local_id(), addr);
    }

    let lab = LocalLab::start(&hub, &cfg)?;
    let mut seeds = lab.seed_records();
    seeds.extend(parse_seeds(&cfg.seeds).context("parsing bootstrap peers")?);
    let report = bootstrap_fabric(node.clone(), &seeds).await;
    if report.all_failed() {
        warn!("no bootstrap peer reachable");
    }

    let service = ServiceDescriptor::new(cfg.service.as_str());
    let strategy = cfg.mode.strategy();
    info!(mode = %cfg.mode, service = service.as_str(), "starting discovery");
    let discovery = start_discovery(
        node.clone(),
        strategy.as_ref(),
        &service,
        cfg.chat.settle_delay(),
    )
    .await
    .context("starting service discovery")?;

    let switcher = RoomSwitcher::new(node.clone(), cfg.chat.clone());
    let session = switcher
        .join(&cfg.user, &cfg.room)
        .await
        .context("joining room")?;

    let capacity = cfg.chat.channel_capacity();
    let (input_tx, input_rx) = mpsc::channel(capacity);
    let (events_tx, events_rx) = mpsc::channel(capacity);
    let cancel = CancellationToken::new();
    let mut router = tokio::spawn(
        EventRouter::new(switcher, session, events_tx).run(input_rx, cancel.clone()),
    );
    tokio::spawn(read_input(input_tx, cancel.clone()));
    let printer = tokio::spawn(print_events(events_rx, node.local_id()));

    tokio::select! {
        res = shutdown_signal() => {
            res?;
            info!("shutting down");
            cancel.cancel();
            if let Err(e) = (&mut router).await {
                warn!(error = %e, "event router failed");
            }
        }
        res = &mut router => {
            if let Err(e) = res {
                warn!(error = %e, "event router failed");
            }
            cancel.cancel();
        }
    }
    let _ = printer.await;
    discovery.shutdown().await;
    lab.shutdown().await;
    Ok(())
}

/// Forward stdin lines to the router until stdin ends or `cancel` fires.
async fn read_input(input: mpsc::Sender<UserInput>, cancel: CancellationToken) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let Some(cmd) = UserInput::parse(&line) else {
                    continue;
                };
                if input.send(cmd).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "reading stdin failed");
                break;
            }
        }
    }
}

/// Render router events as plain lines. Refreshed peer lists are printed only when they change.
async fn print_events(mut events: mpsc::Receiver<UiEvent>, me: NodeId) {
    let mut last_peers: Option<Vec<NodeId>> = None;
    while let Some(event) = events.recv().await {
        match event {
            UiEvent::Message(msg) => {
                println!("{} ({}): {}", msg.sender_name, msg.sender_id.short(), msg.message)
            }
            UiEvent::Sent { name, text } => println!("{} ({}): {}", name, me.short(), text),
            UiEvent::Log(log) => println!("{}", log),
            UiEvent::Peers { peers, requested } => {
                if requested || last_peers.as_ref() != Some(&peers) {
                    let names: Vec<String> = peers.iter().map(|p| p.short()).collect();
                    println!("peers in room: [{}]", names.join(", "));
                    last_peers = Some(peers);
                }
            }
            UiEvent::RoomChanged { room, generation } => {
                last_peers = None;
                println!("joined room {} (session {})", room, generation);
            }
            UiEvent::UserChanged(name) => println!("now chatting as {}", name),
            UiEvent::Closed => break,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("waiting for Ctrl+C")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    }
    Ok(())
}
