//! Service discovery: announce this node for a service, then find and dial the other nodes offering it.
//!
//! Two interchangeable strategies: content-addressed provider records (`Provide`) and
//! rendezvous registration under the literal service name (`Rendezvous`). Both feed one
//! connector that dials every discovered peer except self.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::fabric::{Fabric, FabricError, PeerRecord};

/// Service name shared by every PeerChat node.
pub const DEFAULT_SERVICE: &str = "PawBud/P2P-Chat";

/// Multihash algorithm tag for SHA2-256.
const SHA2_256_CODE: u8 = 0x12;
/// SHA2-256 digest length.
const SHA2_256_LEN: u8 = 0x20;

/// Name of the service nodes look for each other under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor(String);

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Content digest used in provide mode.
    pub fn digest(&self) -> ContentDigest {
        ContentDigest::of(&self.0)
    }

    /// Namespace used in rendezvous mode: the service name verbatim.
    pub fn rendezvous_key(&self) -> &str {
        &self.0
    }
}

impl Default for ServiceDescriptor {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE)
    }
}

/// Multihash of a service name: `[0x12, 0x20] ++ sha256(name)`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest(Vec<u8>);

impl ContentDigest {
    pub fn of(name: &str) -> Self {
        let hash = Sha256::digest(name.as_bytes());
        let mut bytes = Vec::with_capacity(2 + hash.len());
        bytes.push(SHA2_256_CODE);
        bytes.push(SHA2_256_LEN);
        bytes.extend_from_slice(&hash);
        ContentDigest(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", self)
    }
}

/// Discovery failure. Announce failures are fatal to the caller; later dial failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("announce failed: {0}")]
    Announce(#[source] FabricError),
    #[error("find failed: {0}")]
    Find(#[source] FabricError),
    #[error("unknown discovery mode {0:?} (expected provide or rendezvous)")]
    UnknownMode(String),
}

/// One way of making this node findable and finding the others.
#[async_trait]
pub trait DiscoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Make this node findable. Without it the node is undiscoverable by this strategy.
    async fn announce(
        &self,
        fabric: &dyn Fabric,
        service: &ServiceDescriptor,
    ) -> Result<(), DiscoveryError>;

    /// Open a lazy, never-ending sequence of peers offering the service. May repeat peers
    /// and may include self.
    async fn find(
        &self,
        fabric: &dyn Fabric,
        service: &ServiceDescriptor,
    ) -> Result<mpsc::Receiver<PeerRecord>, DiscoveryError>;
}

/// Content-addressed discovery: provide the service digest, find its other providers.
pub struct ProvideStrategy;

#[async_trait]
impl DiscoveryStrategy for ProvideStrategy {
    fn name(&self) -> &'static str {
        "provide"
    }

    async fn announce(
        &self,
        fabric: &dyn Fabric,
        service: &ServiceDescriptor,
    ) -> Result<(), DiscoveryError> {
        let digest = service.digest();
        trace!(%digest, "generated service digest");
        fabric
            .provide(&digest)
            .await
            .map_err(DiscoveryError::Announce)?;
        debug!(%digest, service = service.as_str(), "announced service");
        Ok(())
    }

    async fn find(
        &self,
        fabric: &dyn Fabric,
        service: &ServiceDescriptor,
    ) -> Result<mpsc::Receiver<PeerRecord>, DiscoveryError> {
        fabric
            .find_providers(&service.digest())
            .await
            .map_err(DiscoveryError::Find)
    }
}

/// Rendezvous discovery: register under the service name, find the other registrants.
pub struct RendezvousStrategy;

#[async_trait]
impl DiscoveryStrategy for RendezvousStrategy {
    fn name(&self) -> &'static str {
        "rendezvous"
    }

    async fn announce(
        &self,
        fabric: &dyn Fabric,
        service: &ServiceDescriptor,
    ) -> Result<(), DiscoveryError> {
        let ttl = fabric
            .advertise(service.rendezvous_key())
            .await
            .map_err(DiscoveryError::Announce)?;
        debug!(service = service.as_str(), ttl_secs = ttl.as_secs(), "advertised service");
        Ok(())
    }

    async fn find(
        &self,
        fabric: &dyn Fabric,
        service: &ServiceDescriptor,
    ) -> Result<mpsc::Receiver<PeerRecord>, DiscoveryError> {
        fabric
            .find_peers(service.rendezvous_key())
            .await
            .map_err(DiscoveryError::Find)
    }
}

/// Discovery mode, chosen once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum DiscoveryMode {
    #[default]
    Provide,
    Rendezvous,
}

impl DiscoveryMode {
    pub fn strategy(&self) -> Box<dyn DiscoveryStrategy> {
        match self {
            DiscoveryMode::Provide => Box::new(ProvideStrategy),
            DiscoveryMode::Rendezvous => Box::new(RendezvousStrategy),
        }
    }
}

impl FromStr for DiscoveryMode {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "provide" | "announce" => Ok(DiscoveryMode::Provide),
            "rendezvous" | "advertise" => Ok(DiscoveryMode::Rendezvous),
            _ => Err(DiscoveryError::UnknownMode(s.to_string())),
        }
    }
}

impl TryFrom<String> for DiscoveryMode {
    type Error = DiscoveryError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for DiscoveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DiscoveryMode::Provide => "provide",
            DiscoveryMode::Rendezvous => "rendezvous",
        })
    }
}

/// Connector counters.
#[derive(Debug, Default)]
pub struct DiscoveryStats {
    dialed: AtomicU64,
    skipped_self: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of [`DiscoveryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub dialed: u64,
    pub skipped_self: u64,
    pub failed: u64,
}

impl DiscoveryStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dialed: self.dialed.load(Ordering::Relaxed),
            skipped_self: self.skipped_self.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Running connector started by [`start_discovery`]. Dropping the handle leaves it running.
pub struct DiscoveryHandle {
    cancel: CancellationToken,
    stats: Arc<DiscoveryStats>,
    task: JoinHandle<()>,
}

impl DiscoveryHandle {
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the connector. A dial already in progress finishes first.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the connector to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Announce, wait `settle_delay` for the announcement to propagate, then start dialing
/// whatever the strategy finds. Announce and find errors are returned; everything after
/// that is best-effort and only logged.
pub async fn start_discovery(
    fabric: Arc<dyn Fabric>,
    strategy: &dyn DiscoveryStrategy,
    service: &ServiceDescriptor,
    settle_delay: Duration,
) -> Result<DiscoveryHandle, DiscoveryError> {
    strategy.announce(fabric.as_ref(), service).await?;
    tokio::time::sleep(settle_delay).await;
    let peers = strategy.find(fabric.as_ref(), service).await?;
    info!(mode = strategy.name(), service = service.as_str(), "discovering service peers");

    let cancel = CancellationToken::new();
    let stats = Arc::new(DiscoveryStats::default());
    let task = tokio::spawn(connect_discovered(
        fabric,
        peers,
        cancel.clone(),
        stats.clone(),
    ));
    Ok(DiscoveryHandle {
        cancel,
        stats,
        task,
    })
}

/// Dial every discovered peer except self until the sequence ends or `cancel` fires.
/// Dial failures are counted and logged, never escalated.
pub async fn connect_discovered(
    fabric: Arc<dyn Fabric>,
    mut peers: mpsc::Receiver<PeerRecord>,
    cancel: CancellationToken,
    stats: Arc<DiscoveryStats>,
) {
    let me = fabric.local_id();
    loop {
        let peer = tokio::select! {
            _ = cancel.cancelled() => break,
            peer = peers.recv() => match peer {
                Some(peer) => peer,
                None => break,
            },
        };
        if peer.id == me {
            stats.skipped_self.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        match fabric.dial(&peer).await {
            Ok(()) => {
                stats.dialed.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %peer.id, "connected to discovered peer");
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                debug!(peer = %peer.id, error = %e, "dial to discovered peer failed");
            }
        }
    }
    trace!("discovery connector stopped");
}
