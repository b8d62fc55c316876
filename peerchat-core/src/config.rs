//! Engine timing and sizing, loaded by the host from file, env or flags.

use std::time::Duration;

use serde::Deserialize;

/// Engine configuration shared by discovery, sessions, the switcher and the router.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatConfig {
    /// Wait after announce/advertise before the first find (default 5000 ms).
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// How long an old session may keep flushing sends after a room switch (default 500 ms).
    #[serde(default = "default_grace_delay_ms")]
    pub grace_delay_ms: u64,
    /// Peer-list refresh period for the event router (default 1000 ms).
    #[serde(default = "default_refresh_interval_ms")]
    pub refresh_interval_ms: u64,
    /// Capacity of each session channel (default 64).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_settle_delay_ms() -> u64 {
    5000
}
fn default_grace_delay_ms() -> u64 {
    500
}
fn default_refresh_interval_ms() -> u64 {
    1000
}
fn default_channel_capacity() -> usize {
    64
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            grace_delay_ms: default_grace_delay_ms(),
            refresh_interval_ms: default_refresh_interval_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl ChatConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_delay_ms)
    }

    /// Never zero: `tokio::time::interval` panics on a zero period.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }

    /// Never zero: bounded channels need capacity of at least one.
    pub fn channel_capacity(&self) -> usize {
        self.channel_capacity.max(1)
    }
}
