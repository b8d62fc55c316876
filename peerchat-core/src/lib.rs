//! PeerChat core: serverless peer discovery and room chat over a pub/sub fabric.
//! The network engine is consumed through the `Fabric` trait; `MemoryHub` is an in-process engine.

pub mod bootstrap;
pub mod config;
pub mod discovery;
pub mod fabric;
pub mod identity;
pub mod memory;
pub mod protocol;
pub mod router;
pub mod session;
pub mod switcher;
pub mod wire;

pub use bootstrap::{bootstrap_fabric, parse_seeds, BootstrapReport};
pub use config::ChatConfig;
pub use discovery::{
    connect_discovered, start_discovery, ContentDigest, DiscoveryError, DiscoveryHandle,
    DiscoveryMode, DiscoveryStats, DiscoveryStrategy, ProvideStrategy, RendezvousStrategy,
    ServiceDescriptor, StatsSnapshot, DEFAULT_SERVICE,
};
pub use fabric::{
    Fabric, FabricError, InitializationError, PeerRecord, Subscription, Topic, TopicMessage,
};
pub use identity::{create_identity, Keypair, NodeId, PublicKey};
pub use memory::{MemoryFabric, MemoryHub};
pub use protocol::{topic_name, ChatMessage, LogEvent, LogTag, DEFAULT_ROOM, DEFAULT_USER};
pub use router::{EventRouter, UiEvent, UserInput};
pub use session::{JoinError, RoomSession, SessionClosed};
pub use switcher::RoomSwitcher;
pub use wire::{decode_message, encode_message, WireError};
