//! Local lab: an in-process network with a bootstrap node and companion peers that run
//! discovery and sit in the room, so the whole stack can be exercised from one terminal.

use std::sync::Arc;

use anyhow::Context;
use peerchat_core::{
    bootstrap_fabric, start_discovery, Fabric, Keypair, MemoryFabric, MemoryHub, PeerRecord,
    RoomSession, ServiceDescriptor,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;

pub struct LocalLab {
    bootstrap: Arc<MemoryFabric>,
    cancel: CancellationToken,
    companions: Vec<JoinHandle<()>>,
}

impl LocalLab {
    /// Bring up the lab bootstrap node and `cfg.lab_peers` companions. Companions keep
    /// running in the background until [`LocalLab::shutdown`].
    pub fn start(hub: &MemoryHub, cfg: &Config) -> anyhow::Result<Self> {
        let bootstrap = hub
            .spawn_node(Keypair::generate(), 0)
            .context("starting lab bootstrap node")?;
        info!(node = %bootstrap.local_id(), "lab bootstrap node up");

        let cancel = CancellationToken::new();
        let mut companions = Vec::with_capacity(cfg.lab_peers);
        for index in 1..=cfg.lab_peers {
            let node = hub
                .spawn_node(Keypair::generate(), 0)
                .with_context(|| format!("starting lab peer {}", index))?;
            companions.push(tokio::spawn(run_companion(
                index,
                node,
                bootstrap.local_record(),
                cfg.clone(),
                cancel.clone(),
            )));
        }
        Ok(Self {
            bootstrap,
            cancel,
            companions,
        })
    }

    /// Records to bootstrap from.
    pub fn seed_records(&self) -> Vec<PeerRecord> {
        vec![self.bootstrap.local_record()]
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        for companion in self.companions {
            if let Err(e) = companion.await {
                warn!(error = %e, "lab peer task failed");
            }
        }
    }
}

async fn run_companion(
    index: usize,
    node: Arc<MemoryFabric>,
    seed: PeerRecord,
    cfg: Config,
    cancel: CancellationToken,
) {
    let name = format!("lab-{}", index);
    bootstrap_fabric(node.clone(), &[seed]).await;

    let strategy = cfg.mode.strategy();
    let service = ServiceDescriptor::new(cfg.service.as_str());
    let discovery = tokio::select! {
        _ = cancel.cancelled() => return,
        res = start_discovery(node.clone(), strategy.as_ref(), &service, cfg.chat.settle_delay()) => res,
    };
    let discovery = match discovery {
        Ok(handle) => handle,
        Err(e) => {
            warn!(peer = %name, error = %e, "lab peer discovery failed");
            return;
        }
    };

    let mut session = match RoomSession::join(node.as_ref(), &name, &cfg.room, &cfg.chat).await {
        Ok(session) => session,
        Err(e) => {
            warn!(peer = %name, error = %e, "lab peer could not join room");
            discovery.shutdown().await;
            return;
        }
    };
    if session.send(format!("hello from {}", name)).await.is_err() {
        debug!(peer = %name, "greeting not sent");
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = session.incoming.recv() => match msg {
                Some(msg) => info!(peer = %name, from = %msg.sender_name, "lab peer received: {}", msg.message),
                None => break,
            },
            log = session.logs.recv() => if let Some(log) = log {
                debug!(peer = %name, %log, "lab peer session log");
            },
        }
    }
    session.exit().await;
    discovery.shutdown().await;
}
