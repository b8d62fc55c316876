//! Network engine seam: what the chat core needs from the peer-to-peer fabric.
//!
//! The engine owns addressing, secure transport, routing and the shared address book;
//! its implementations are responsible for their own locking. The core only talks to it
//! through [`Fabric`], [`Topic`] and [`Subscription`].

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::discovery::ContentDigest;
use crate::identity::{NodeId, NodeIdParseError};

/// A peer's identity plus its known network addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: NodeId,
    pub addrs: Vec<SocketAddr>,
    /// Discovery TTL, when the record came from a registry that sets one.
    pub ttl: Option<Duration>,
}

impl PeerRecord {
    pub fn new(id: NodeId, addrs: Vec<SocketAddr>) -> Self {
        Self {
            id,
            addrs,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@", self.id)?;
        for (i, addr) in self.addrs.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", addr)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PeerRecordParseError {
    #[error("expected <node-id>@<addr>[,<addr>...]")]
    Format,
    #[error("bad node id: {0}")]
    NodeId(#[from] NodeIdParseError),
    #[error("bad address {0:?}")]
    Addr(String),
}

impl FromStr for PeerRecord {
    type Err = PeerRecordParseError;

    /// Parse `"<base58 node id>@<ip:port>[,<ip:port>...]"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addrs) = s.trim().split_once('@').ok_or(PeerRecordParseError::Format)?;
        let id: NodeId = id.parse()?;
        let addrs = addrs
            .split(',')
            .map(|a| {
                a.trim()
                    .parse::<SocketAddr>()
                    .map_err(|_| PeerRecordParseError::Addr(a.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if addrs.is_empty() {
            return Err(PeerRecordParseError::Format);
        }
        Ok(PeerRecord::new(id, addrs))
    }
}

/// One message delivered by a topic subscription.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    /// Engine-assigned message ID.
    pub id: uuid::Uuid,
    /// Node that published the message.
    pub source: NodeId,
    /// Node that forwarded it to us (equals `source` on a direct hop).
    pub received_from: NodeId,
    pub data: Vec<u8>,
}

/// Error from the network engine.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    #[error("peer {0} unreachable")]
    Unreachable(NodeId),
    #[error("cannot dial self")]
    SelfDial,
    #[error("no peers in routing table")]
    NoPeers,
    #[error("topic {0} is closed")]
    TopicClosed(String),
    #[error("subscription closed")]
    SubscriptionClosed,
    #[error("engine error: {0}")]
    Engine(String),
}

/// Error bringing up a network engine. Fatal: the process cannot proceed without one.
#[derive(Debug, thiserror::Error)]
pub enum InitializationError {
    #[error("listen port {0} already in use")]
    PortInUse(u16),
    #[error("identity {0} already registered")]
    DuplicateIdentity(NodeId),
    #[error("no free listen port")]
    PortsExhausted,
}

/// The network engine as seen by the chat core.
#[async_trait]
pub trait Fabric: Send + Sync {
    /// This node's ID.
    fn local_id(&self) -> NodeId;

    fn listen_addrs(&self) -> Vec<SocketAddr>;

    /// Snapshot of the shared address book (newest record per node).
    fn address_book(&self) -> Vec<PeerRecord>;

    /// Connect to a peer. Runs to its own completion or failure; not cancellable.
    async fn dial(&self, peer: &PeerRecord) -> Result<(), FabricError>;

    /// Join a pub/sub topic by name.
    async fn join_topic(&self, name: &str) -> Result<Arc<dyn Topic>, FabricError>;

    /// Announce this node as a provider of `digest`.
    async fn provide(&self, digest: &ContentDigest) -> Result<(), FabricError>;

    /// Lazily enumerate providers of `digest`. The sequence never ends on its own;
    /// it stops when the receiver is dropped.
    async fn find_providers(
        &self,
        digest: &ContentDigest,
    ) -> Result<mpsc::Receiver<PeerRecord>, FabricError>;

    /// Register this node under a rendezvous namespace. Returns the registration TTL.
    async fn advertise(&self, namespace: &str) -> Result<Duration, FabricError>;

    /// Lazily enumerate nodes registered under a rendezvous namespace.
    async fn find_peers(&self, namespace: &str) -> Result<mpsc::Receiver<PeerRecord>, FabricError>;
}

/// A joined pub/sub topic.
#[async_trait]
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    /// Publish to every subscriber, including this node's own subscription.
    async fn publish(&self, data: Vec<u8>) -> Result<(), FabricError>;

    /// Open this node's subscription to the topic.
    fn subscribe(&self) -> Result<Box<dyn Subscription>, FabricError>;

    /// Nodes currently known to be subscribed, excluding self.
    fn list_peers(&self) -> Vec<NodeId>;

    /// Leave the topic. Publishing afterwards fails with `TopicClosed`.
    fn close(&self);
}

/// A topic subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Next message. Cancel-safe: dropping the future loses no message.
    /// Returns `SubscriptionClosed` once the subscription is cancelled.
    async fn next(&mut self) -> Result<TopicMessage, FabricError>;

    fn cancel(&mut self);
}
