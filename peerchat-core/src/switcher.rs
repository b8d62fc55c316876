//! Room switching: join the new room first, swap it in, then drain and tear down the old one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ChatConfig;
use crate::fabric::Fabric;
use crate::session::{JoinError, RoomSession};

/// Creates room sessions on one fabric and numbers them.
pub struct RoomSwitcher {
    fabric: Arc<dyn Fabric>,
    config: ChatConfig,
    generation: AtomicU64,
}

impl RoomSwitcher {
    pub fn new(fabric: Arc<dyn Fabric>, config: ChatConfig) -> Self {
        Self {
            fabric,
            config,
            generation: AtomicU64::new(0),
        }
    }

    pub fn fabric(&self) -> &Arc<dyn Fabric> {
        &self.fabric
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Join a room under the next generation number. The first session gets generation 0.
    pub async fn join(&self, display_name: &str, room_name: &str) -> Result<RoomSession, JoinError> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        RoomSession::join_generation(
            self.fabric.as_ref(),
            display_name,
            room_name,
            &self.config,
            generation,
        )
        .await
    }

    /// Replace `active` with a session in `new_room`.
    ///
    /// On failure `active` is left running and untouched. On success the old session is
    /// drained (bounded by the grace delay) and exited in the background; the returned
    /// handle completes once it is gone. An empty `display_name` keeps the current name.
    pub async fn switch_room(
        &self,
        active: &mut RoomSession,
        display_name: &str,
        new_room: &str,
    ) -> Result<JoinHandle<()>, JoinError> {
        let display_name = if display_name.trim().is_empty() {
            active.display_name()
        } else {
            display_name.to_string()
        };
        let next = self.join(&display_name, new_room).await?;
        let old = std::mem::replace(active, next);
        info!(
            from = old.room_name(),
            to = active.room_name(),
            generation = active.generation(),
            "switched room"
        );
        let grace = self.config.grace_delay();
        Ok(tokio::spawn(old.drain_and_exit(grace)))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::discovery::ContentDigest;
    use crate::fabric::{FabricError, PeerRecord, Topic};
    use crate::identity::{Keypair, NodeId};
    use crate::memory::{MemoryFabric, MemoryHub};

    const WAIT: Duration = Duration::from_secs(2);

    /// Delegates to a memory node but refuses to join one topic.
    struct Refusing {
        inner: Arc<MemoryFabric>,
        refused: String,
    }

    #[async_trait]
    impl Fabric for Refusing {
        fn local_id(&self) -> NodeId {
            self.inner.local_id()
        }
        fn listen_addrs(&self) -> Vec<SocketAddr> {
            self.inner.listen_addrs()
        }
        fn address_book(&self) -> Vec<PeerRecord> {
            self.inner.address_book()
        }
        async fn dial(&self, peer: &PeerRecord) -> Result<(), FabricError> {
            self.inner.dial(peer).await
        }
        async fn join_topic(&self, name: &str) -> Result<Arc<dyn Topic>, FabricError> {
            if name == self.refused {
                return Err(FabricError::Engine("refused".into()));
            }
            self.inner.join_topic(name).await
        }
        async fn provide(&self, digest: &ContentDigest) -> Result<(), FabricError> {
            self.inner.provide(digest).await
        }
        async fn find_providers(
            &self,
            digest: &ContentDigest,
        ) -> Result<mpsc::Receiver<PeerRecord>, FabricError> {
            self.inner.find_providers(digest).await
        }
        async fn advertise(&self, namespace: &str) -> Result<Duration, FabricError> {
            self.inner.advertise(namespace).await
        }
        async fn find_peers(&self, namespace: &str) -> Result<mpsc::Receiver<PeerRecord>, FabricError> {
            self.inner.find_peers(namespace).await
        }
    }

    #[tokio::test]
    async fn generations_count_up() {
        let hub = MemoryHub::new();
        let a = hub.spawn_node(Keypair::generate(), 0).unwrap();
        let switcher = RoomSwitcher::new(a, ChatConfig::default());
        let mut active = switcher.join("alice", "one").await.unwrap();
        assert_eq!(active.generation(), 0);

        let teardown = switcher.switch_room(&mut active, "", "two").await.unwrap();
        assert_eq!(active.generation(), 1);
        assert_eq!(active.room_name(), "two");
        assert_eq!(active.display_name(), "alice");
        teardown.await.unwrap();

        let teardown = switcher.switch_room(&mut active, "bob", "").await.unwrap();
        assert_eq!(active.generation(), 2);
        assert_eq!(active.room_name(), "default_room");
        assert_eq!(active.display_name(), "bob");
        teardown.await.unwrap();
        active.exit().await;
    }

    #[tokio::test]
    async fn failed_switch_keeps_active_session() {
        let hub = MemoryHub::new();
        let a = hub.spawn_node(Keypair::generate(), 0).unwrap();
        let b = hub.spawn_node(Keypair::generate(), 0).unwrap();
        a.dial(&b.local_record()).await.unwrap();
        let refusing = Arc::new(Refusing {
            inner: a.clone(),
            refused: "room-peerchat-locked".into(),
        });
        let switcher = RoomSwitcher::new(refusing, ChatConfig::default());
        let mut active = switcher.join("alice", "lobby").await.unwrap();
        let mut other = RoomSession::join(b.as_ref(), "bob", "lobby", &ChatConfig::default())
            .await
            .unwrap();

        let err = switcher
            .switch_room(&mut active, "", "locked")
            .await
            .unwrap_err();
        assert!(matches!(err, JoinError::Topic { .. }));
        assert_eq!(active.room_name(), "lobby");
        assert_eq!(active.generation(), 0);

        active.send("still in the lobby").await.unwrap();
        let got = tokio::time::timeout(WAIT, other.incoming.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.message, "still in the lobby");
        active.exit().await;
        other.exit().await;
    }

    #[tokio::test]
    async fn old_room_gets_queued_sends_and_new_room_gets_later_ones() {
        let hub = MemoryHub::new();
        let a = hub.spawn_node(Keypair::generate(), 0).unwrap();
        let b = hub.spawn_node(Keypair::generate(), 0).unwrap();
        a.dial(&b.local_record()).await.unwrap();
        let config = ChatConfig::default();
        let mut b_one = RoomSession::join(b.as_ref(), "bob", "one", &config).await.unwrap();
        let mut b_two = RoomSession::join(b.as_ref(), "bob", "two", &config).await.unwrap();

        let switcher = RoomSwitcher::new(a.clone(), config);
        let mut active = switcher.join("alice", "one").await.unwrap();
        for i in 0..5 {
            active.send(format!("before {}", i)).await.unwrap();
        }
        let teardown = switcher.switch_room(&mut active, "", "two").await.unwrap();
        for i in 0..5 {
            active.send(format!("after {}", i)).await.unwrap();
        }
        teardown.await.unwrap();

        for i in 0..5 {
            let got = tokio::time::timeout(WAIT, b_one.incoming.recv()).await.unwrap().unwrap();
            assert_eq!(got.message, format!("before {}", i));
            let got = tokio::time::timeout(WAIT, b_two.incoming.recv()).await.unwrap().unwrap();
            assert_eq!(got.message, format!("after {}", i));
        }
        assert!(b_one.peer_list().is_empty());
        assert_eq!(b_two.peer_list(), vec![a.local_id()]);

        active.exit().await;
        b_one.exit().await;
        b_two.exit().await;
    }
}
