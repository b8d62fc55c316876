//! In-process fabric: every node lives in one `MemoryHub`.
//!
//! Connections form an undirected graph; a publish reaches every subscriber in the
//! publisher's connected component, the publisher included. Provider records and
//! rendezvous registrations are hub-global but only visible to connected nodes.
//! `set_reachable` injects dial failures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::discovery::ContentDigest;
use crate::fabric::{
    Fabric, FabricError, InitializationError, PeerRecord, Subscription, Topic, TopicMessage,
};
use crate::identity::{Keypair, NodeId};

const FIRST_AUTO_PORT: u16 = 40000;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const RENDEZVOUS_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const FIND_BUFFER: usize = 16;

struct NodeState {
    addr: SocketAddr,
    reachable: bool,
    connections: HashSet<NodeId>,
    address_book: HashMap<NodeId, PeerRecord>,
    dial_log: Vec<NodeId>,
}

struct Subscriber {
    node: NodeId,
    tx: mpsc::UnboundedSender<TopicMessage>,
}

#[derive(Default)]
struct TopicState {
    /// Open topic handles per node.
    members: HashMap<NodeId, usize>,
    subscribers: HashMap<u64, Subscriber>,
}

struct Registration {
    record: PeerRecord,
    expires_at: Instant,
}

#[derive(Default)]
struct HubState {
    nodes: HashMap<NodeId, NodeState>,
    ports: HashMap<u16, NodeId>,
    topics: HashMap<String, TopicState>,
    providers: HashMap<ContentDigest, HashMap<NodeId, PeerRecord>>,
    rendezvous: HashMap<String, HashMap<NodeId, Registration>>,
    next_sub_id: u64,
}

impl HubState {
    fn own_record(&self, id: NodeId) -> Option<PeerRecord> {
        self.nodes
            .get(&id)
            .map(|n| PeerRecord::new(id, vec![n.addr]))
    }

    fn is_connected(&self, id: NodeId) -> bool {
        self.nodes
            .get(&id)
            .map(|n| !n.connections.is_empty())
            .unwrap_or(false)
    }

    /// Breadth-first walk of the connection graph. Maps every reachable node to the
    /// neighbour it was reached through (`start` maps to itself).
    fn routes_from(&self, start: NodeId) -> HashMap<NodeId, NodeId> {
        let mut hops = HashMap::new();
        if !self.nodes.contains_key(&start) {
            return hops;
        }
        hops.insert(start, start);
        let mut queue = VecDeque::from([start]);
        while let Some(at) = queue.pop_front() {
            let Some(node) = self.nodes.get(&at) else {
                continue;
            };
            for next in &node.connections {
                if !hops.contains_key(next) && self.nodes.contains_key(next) {
                    hops.insert(*next, at);
                    queue.push_back(*next);
                }
            }
        }
        hops
    }

    fn remove_node(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            self.ports.remove(&node.addr.port());
        }
        for other in self.nodes.values_mut() {
            other.connections.remove(&id);
        }
        for topic in self.topics.values_mut() {
            topic.members.remove(&id);
            topic.subscribers.retain(|_, s| s.node != id);
        }
        for providers in self.providers.values_mut() {
            providers.remove(&id);
        }
        for regs in self.rendezvous.values_mut() {
            regs.remove(&id);
        }
    }
}

fn lock(state: &Mutex<HubState>) -> MutexGuard<'_, HubState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared in-process network. Cheap to clone; clones address the same network.
#[derive(Clone)]
pub struct MemoryHub {
    state: Arc<Mutex<HubState>>,
    poll_interval: Duration,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Set how often find sequences re-check the provider and rendezvous registries.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            poll_interval,
        }
    }

    /// Bring up a node on the hub, listening on `127.0.0.1:listen_port` (0 picks a free port).
    pub fn spawn_node(
        &self,
        keypair: Keypair,
        listen_port: u16,
    ) -> Result<Arc<MemoryFabric>, InitializationError> {
        let id = keypair.node_id();
        let mut st = lock(&self.state);
        if st.nodes.contains_key(&id) {
            return Err(InitializationError::DuplicateIdentity(id));
        }
        let port = if listen_port == 0 {
            (FIRST_AUTO_PORT..=u16::MAX)
                .find(|p| !st.ports.contains_key(p))
                .ok_or(InitializationError::PortsExhausted)?
        } else if st.ports.contains_key(&listen_port) {
            return Err(InitializationError::PortInUse(listen_port));
        } else {
            listen_port
        };
        let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port);
        st.ports.insert(port, id);
        st.nodes.insert(
            id,
            NodeState {
                addr,
                reachable: true,
                connections: HashSet::new(),
                address_book: HashMap::new(),
                dial_log: Vec::new(),
            },
        );
        debug!(node = %id, %addr, "memory node up");
        Ok(Arc::new(MemoryFabric {
            state: self.state.clone(),
            poll_interval: self.poll_interval,
            keypair,
            addr,
        }))
    }

    /// Make dials to `id` fail (`false`) or succeed again (`true`).
    pub fn set_reachable(&self, id: NodeId, reachable: bool) {
        if let Some(node) = lock(&self.state).nodes.get_mut(&id) {
            node.reachable = reachable;
        }
    }

    /// Dialable record for a node on this hub.
    pub fn record_of(&self, id: NodeId) -> Option<PeerRecord> {
        lock(&self.state).own_record(id)
    }
}

/// One node on a [`MemoryHub`]. Leaves the hub when dropped.
pub struct MemoryFabric {
    state: Arc<Mutex<HubState>>,
    poll_interval: Duration,
    keypair: Keypair,
    addr: SocketAddr,
}

impl MemoryFabric {
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// This node's dialable record.
    pub fn local_record(&self) -> PeerRecord {
        PeerRecord::new(self.keypair.node_id(), vec![self.addr])
    }

    /// Every node this node has tried to dial, in order.
    pub fn dial_log(&self) -> Vec<NodeId> {
        lock(&self.state)
            .nodes
            .get(&self.keypair.node_id())
            .map(|n| n.dial_log.clone())
            .unwrap_or_default()
    }

    /// Nodes with a direct connection to this one.
    pub fn connections(&self) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = lock(&self.state)
            .nodes
            .get(&self.keypair.node_id())
            .map(|n| n.connections.iter().copied().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Spawn a find sequence. `lookup` returns `None` once the requester has left the hub.
    fn spawn_finder<F>(&self, lookup: F) -> mpsc::Receiver<PeerRecord>
    where
        F: Fn(&HubState) -> Option<Vec<PeerRecord>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(FIND_BUFFER);
        let state = self.state.clone();
        let poll = self.poll_interval;
        tokio::spawn(async move {
            let mut seen: HashMap<NodeId, PeerRecord> = HashMap::new();
            loop {
                let batch = {
                    let st = lock(&state);
                    lookup(&st)
                };
                let Some(batch) = batch else {
                    return;
                };
                for rec in batch {
                    if seen.get(&rec.id) == Some(&rec) {
                        continue;
                    }
                    seen.insert(rec.id, rec.clone());
                    if tx.send(rec).await.is_err() {
                        return;
                    }
                }
                tokio::select! {
                    _ = tx.closed() => return,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        });
        rx
    }
}

impl Drop for MemoryFabric {
    fn drop(&mut self) {
        lock(&self.state).remove_node(self.keypair.node_id());
    }
}

#[async_trait]
impl Fabric for MemoryFabric {
    fn local_id(&self) -> NodeId {
        self.keypair.node_id()
    }

    fn listen_addrs(&self) -> Vec<SocketAddr> {
        vec![self.addr]
    }

    fn address_book(&self) -> Vec<PeerRecord> {
        let mut out: Vec<PeerRecord> = lock(&self.state)
            .nodes
            .get(&self.keypair.node_id())
            .map(|n| n.address_book.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by_key(|r| r.id);
        out
    }

    async fn dial(&self, peer: &PeerRecord) -> Result<(), FabricError> {
        tokio::task::yield_now().await;
        let me = self.keypair.node_id();
        let mut st = lock(&self.state);
        if let Some(node) = st.nodes.get_mut(&me) {
            node.dial_log.push(peer.id);
        }
        if peer.id == me {
            return Err(FabricError::SelfDial);
        }
        let target_addr = match st.nodes.get(&peer.id) {
            Some(t) if t.reachable && (peer.addrs.is_empty() || peer.addrs.contains(&t.addr)) => {
                t.addr
            }
            _ => return Err(FabricError::Unreachable(peer.id)),
        };
        let me_addr = self.addr;
        if let Some(node) = st.nodes.get_mut(&me) {
            node.connections.insert(peer.id);
            node.address_book
                .insert(peer.id, PeerRecord::new(peer.id, vec![target_addr]));
        }
        if let Some(node) = st.nodes.get_mut(&peer.id) {
            node.connections.insert(me);
            node.address_book
                .insert(me, PeerRecord::new(me, vec![me_addr]));
        }
        trace!(from = %me, to = %peer.id, "memory dial ok");
        Ok(())
    }

    async fn join_topic(&self, name: &str) -> Result<Arc<dyn Topic>, FabricError> {
        let me = self.keypair.node_id();
        let mut st = lock(&self.state);
        if !st.nodes.contains_key(&me) {
            return Err(FabricError::Engine("node has left the hub".into()));
        }
        *st.topics
            .entry(name.to_string())
            .or_default()
            .members
            .entry(me)
            .or_insert(0) += 1;
        Ok(Arc::new(MemoryTopic {
            state: self.state.clone(),
            name: name.to_string(),
            node: me,
            closed: AtomicBool::new(false),
        }))
    }

    async fn provide(&self, digest: &ContentDigest) -> Result<(), FabricError> {
        let me = self.keypair.node_id();
        let mut st = lock(&self.state);
        if !st.is_connected(me) {
            return Err(FabricError::NoPeers);
        }
        let rec = st
            .own_record(me)
            .ok_or_else(|| FabricError::Engine("node has left the hub".into()))?;
        st.providers
            .entry(digest.clone())
            .or_default()
            .insert(me, rec);
        Ok(())
    }

    async fn find_providers(
        &self,
        digest: &ContentDigest,
    ) -> Result<mpsc::Receiver<PeerRecord>, FabricError> {
        let me = self.keypair.node_id();
        let digest = digest.clone();
        Ok(self.spawn_finder(move |st| {
            if !st.nodes.contains_key(&me) {
                return None;
            }
            if !st.is_connected(me) {
                return Some(Vec::new());
            }
            let mut batch: Vec<PeerRecord> = st
                .providers
                .get(&digest)
                .map(|p| p.values().cloned().collect())
                .unwrap_or_default();
            batch.sort_by_key(|r| r.id);
            Some(batch)
        }))
    }

    async fn advertise(&self, namespace: &str) -> Result<Duration, FabricError> {
        let me = self.keypair.node_id();
        let mut st = lock(&self.state);
        if !st.is_connected(me) {
            return Err(FabricError::NoPeers);
        }
        let rec = st
            .own_record(me)
            .ok_or_else(|| FabricError::Engine("node has left the hub".into()))?
            .with_ttl(RENDEZVOUS_TTL);
        st.rendezvous.entry(namespace.to_string()).or_default().insert(
            me,
            Registration {
                record: rec,
                expires_at: Instant::now() + RENDEZVOUS_TTL,
            },
        );
        Ok(RENDEZVOUS_TTL)
    }

    async fn find_peers(&self, namespace: &str) -> Result<mpsc::Receiver<PeerRecord>, FabricError> {
        let me = self.keypair.node_id();
        let namespace = namespace.to_string();
        Ok(self.spawn_finder(move |st| {
            if !st.nodes.contains_key(&me) {
                return None;
            }
            if !st.is_connected(me) {
                return Some(Vec::new());
            }
            let now = Instant::now();
            let mut batch: Vec<PeerRecord> = st
                .rendezvous
                .get(&namespace)
                .map(|regs| {
                    regs.values()
                        .filter(|r| r.expires_at > now)
                        .map(|r| r.record.clone())
                        .collect()
                })
                .unwrap_or_default();
            batch.sort_by_key(|r| r.id);
            Some(batch)
        }))
    }
}

struct MemoryTopic {
    state: Arc<Mutex<HubState>>,
    name: String,
    node: NodeId,
    closed: AtomicBool,
}

#[async_trait]
impl Topic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, data: Vec<u8>) -> Result<(), FabricError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FabricError::TopicClosed(self.name.clone()));
        }
        let st = lock(&self.state);
        let Some(topic) = st.topics.get(&self.name) else {
            return Err(FabricError::TopicClosed(self.name.clone()));
        };
        let routes = st.routes_from(self.node);
        let id = uuid::Uuid::new_v4();
        for sub in topic.subscribers.values() {
            if let Some(hop) = routes.get(&sub.node) {
                let received_from = if sub.node == self.node { self.node } else { *hop };
                let _ = sub.tx.send(TopicMessage {
                    id,
                    source: self.node,
                    received_from,
                    data: data.clone(),
                });
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> Result<Box<dyn Subscription>, FabricError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FabricError::TopicClosed(self.name.clone()));
        }
        let mut st = lock(&self.state);
        let sub_id = st.next_sub_id;
        st.next_sub_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        st.topics
            .entry(self.name.clone())
            .or_default()
            .subscribers
            .insert(
                sub_id,
                Subscriber {
                    node: self.node,
                    tx,
                },
            );
        Ok(Box::new(MemorySubscription {
            state: self.state.clone(),
            topic: self.name.clone(),
            sub_id,
            rx,
            cancelled: false,
        }))
    }

    fn list_peers(&self) -> Vec<NodeId> {
        let st = lock(&self.state);
        let Some(topic) = st.topics.get(&self.name) else {
            return Vec::new();
        };
        let routes = st.routes_from(self.node);
        let mut peers: Vec<NodeId> = topic
            .subscribers
            .values()
            .map(|s| s.node)
            .filter(|n| *n != self.node && routes.contains_key(n))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        peers.sort();
        peers
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut st = lock(&self.state);
        let Some(topic) = st.topics.get_mut(&self.name) else {
            return;
        };
        if let Some(count) = topic.members.get_mut(&self.node) {
            *count -= 1;
            if *count == 0 {
                topic.members.remove(&self.node);
            }
        }
        if topic.members.is_empty() && topic.subscribers.is_empty() {
            st.topics.remove(&self.name);
        }
    }
}

impl Drop for MemoryTopic {
    fn drop(&mut self) {
        self.close();
    }
}

struct MemorySubscription {
    state: Arc<Mutex<HubState>>,
    topic: String,
    sub_id: u64,
    rx: mpsc::UnboundedReceiver<TopicMessage>,
    cancelled: bool,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<TopicMessage, FabricError> {
        if self.cancelled {
            return Err(FabricError::SubscriptionClosed);
        }
        self.rx.recv().await.ok_or(FabricError::SubscriptionClosed)
    }

    fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.rx.close();
        let mut st = lock(&self.state);
        if let Some(topic) = st.topics.get_mut(&self.topic) {
            topic.subscribers.remove(&self.sub_id);
        }
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
