//! Join the shared fabric: dial a fixed seed set concurrently, tolerating individual failures.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::fabric::{Fabric, PeerRecord, PeerRecordParseError};

/// Outcome of a bootstrap round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub connected: usize,
    pub attempted: usize,
}

impl BootstrapReport {
    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.connected == 0
    }
}

/// Dial every seed concurrently and independently. Never fails: unreachable seeds are
/// only logged, since the node may still join through peers it learns about later.
pub async fn bootstrap_fabric(fabric: Arc<dyn Fabric>, seeds: &[PeerRecord]) -> BootstrapReport {
    let mut dials = JoinSet::new();
    for seed in seeds.iter().cloned() {
        let fabric = fabric.clone();
        dials.spawn(async move {
            let res = fabric.dial(&seed).await;
            (seed.id, res)
        });
    }

    let mut report = BootstrapReport {
        connected: 0,
        attempted: seeds.len(),
    };
    while let Some(joined) = dials.join_next().await {
        match joined {
            Ok((_, Ok(()))) => report.connected += 1,
            Ok((seed, Err(e))) => debug!(%seed, error = %e, "bootstrap dial failed"),
            Err(e) => warn!(error = %e, "bootstrap dial task failed"),
        }
    }
    info!(
        connected = report.connected,
        attempted = report.attempted,
        "connected to {} out of {} bootstrap peers",
        report.connected,
        report.attempted
    );
    report
}

/// Parse a seed list of `"<node id>@<addr>[,<addr>...]"` entries. Blank entries are skipped.
pub fn parse_seeds<S: AsRef<str>>(entries: &[S]) -> Result<Vec<PeerRecord>, PeerRecordParseError> {
    entries
        .iter()
        .map(|s| s.as_ref().trim())
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::memory::MemoryHub;

    #[tokio::test]
    async fn partial_failure_is_reported_not_fatal() {
        let hub = MemoryHub::new();
        let me = hub.spawn_node(Keypair::generate(), 0).unwrap();
        let mut seeds = Vec::new();
        for i in 0..5 {
            let seed = hub.spawn_node(Keypair::generate(), 0).unwrap();
            if i % 2 == 1 {
                hub.set_reachable(seed.local_id(), false);
            }
            seeds.push(seed);
        }
        let records: Vec<PeerRecord> = seeds.iter().map(|s| s.local_record()).collect();

        let report = bootstrap_fabric(me.clone(), &records).await;
        assert_eq!(
            report,
            BootstrapReport {
                connected: 3,
                attempted: 5
            }
        );
        assert!(!report.all_failed());
        assert_eq!(me.address_book().len(), 3);
    }

    #[tokio::test]
    async fn total_failure_and_empty_seed_list() {
        let hub = MemoryHub::new();
        let me = hub.spawn_node(Keypair::generate(), 0).unwrap();
        let gone = PeerRecord::new(
            Keypair::generate().node_id(),
            vec!["127.0.0.1:9".parse().unwrap()],
        );
        let report = bootstrap_fabric(me.clone(), &[gone.clone(), gone]).await;
        assert_eq!(report.connected, 0);
        assert_eq!(report.attempted, 2);
        assert!(report.all_failed());

        let report = bootstrap_fabric(me, &[]).await;
        assert_eq!(report, BootstrapReport::default());
        assert!(!report.all_failed());
    }

    #[test]
    fn seed_list_parsing() {
        let a = Keypair::generate().node_id();
        let b = Keypair::generate().node_id();
        let entries = vec![
            format!("{}@127.0.0.1:4001", a),
            "  ".to_string(),
            format!(" {}@127.0.0.1:4002,127.0.0.1:4003 ", b),
        ];
        let seeds = parse_seeds(&entries).unwrap();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].id, a);
        assert_eq!(seeds[1].addrs.len(), 2);

        assert!(parse_seeds(&["garbage"]).is_err());
    }
}
