//! Shared helpers for the integration tests: a connected in-process network and short timings.

use std::sync::Arc;
use std::time::Duration;

use peerchat_core::{ChatConfig, Fabric, Keypair, MemoryFabric, MemoryHub};

/// Default timeout for test operations.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Initialize test logging. Safe to call multiple times.
#[allow(dead_code)]
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("peerchat_core=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Run an async operation with a timeout, panicking if it doesn't finish.
#[allow(dead_code)]
pub async fn with_timeout<T, F>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(TEST_TIMEOUT, fut)
        .await
        .expect("test operation timed out")
}

/// Engine timings shrunk for tests.
#[allow(dead_code)]
pub fn fast_config() -> ChatConfig {
    ChatConfig {
        settle_delay_ms: 20,
        grace_delay_ms: 200,
        refresh_interval_ms: 50,
        ..ChatConfig::default()
    }
}

/// Hub that polls its registries quickly.
#[allow(dead_code)]
pub fn fast_hub() -> MemoryHub {
    MemoryHub::with_poll_interval(Duration::from_millis(5))
}

/// `n` nodes where every node is connected to the first one.
#[allow(dead_code)]
pub async fn star(hub: &MemoryHub, n: usize) -> Vec<Arc<MemoryFabric>> {
    let nodes: Vec<Arc<MemoryFabric>> = (0..n)
        .map(|_| hub.spawn_node(Keypair::generate(), 0).expect("spawn node"))
        .collect();
    for node in nodes.iter().skip(1) {
        node.dial(&nodes[0].local_record()).await.expect("dial hub node");
    }
    nodes
}
