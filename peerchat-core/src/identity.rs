//! Node identity: keypair, node ID and its human-readable encoding.

use std::fmt;
use std::str::FromStr;

use rand::rngs::{OsRng, StdRng};
use rand::{CryptoRng, RngCore, SeedableRng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Node public key (32 bytes, X25519).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }
}

/// Node ID: deterministic hash of public key. Stable for the lifetime of the keypair.
/// Displayed and parsed as base58; serialized the same way.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 16]);

impl NodeId {
    /// Derive node ID from a public key (same as Keypair does).
    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(public);
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        NodeId(id)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Shortened form for log lines and peer lists.
    pub fn short(&self) -> String {
        let full = self.to_string();
        let tail = full.len().saturating_sub(6);
        full[tail..].to_string()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeIdParseError {
    #[error("invalid base58: {0}")]
    Base58(#[from] bs58::decode::Error),
    #[error("expected 16 bytes, got {0}")]
    Length(usize),
}

impl FromStr for NodeId {
    type Err = NodeIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let buf = bs58::decode(s).into_vec()?;
        let len = buf.len();
        let bytes: [u8; 16] = buf
            .try_into()
            .map_err(|_| NodeIdParseError::Length(len))?;
        Ok(NodeId(bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// X25519 keypair. Keep secret key private; expose only public key and node ID.
pub struct Keypair {
    #[allow(dead_code)]
    secret: StaticSecret,
    public: PublicKey,
    node_id: NodeId,
}

impl Keypair {
    /// Generate a new random keypair from the OS entropy source.
    pub fn generate() -> Self {
        Self::from_rng(&mut OsRng)
    }

    /// Generate a keypair from the given source. A seeded source yields the same keypair every time.
    pub fn from_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let public_x = X25519PublicKey::from(&secret);
        let public = PublicKey(public_x.to_bytes());
        let node_id = NodeId::from_public_key(public.as_bytes());
        Self {
            secret,
            public,
            node_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// Create the node identity. With a seed the identity is reproducible (test and debug nodes),
/// without one it comes from the OS entropy source.
pub fn create_identity(seed: Option<u64>) -> Keypair {
    match seed {
        Some(seed) => Keypair::from_rng(&mut StdRng::seed_from_u64(seed)),
        None => Keypair::generate(),
    }
}
