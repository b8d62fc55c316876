//! Load config from file and environment; command-line flags are applied on top by `main`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use peerchat_core::{ChatConfig, DiscoveryMode, DEFAULT_SERVICE};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/peerchat/config.toml or /etc/peerchat/config.toml.
/// Env overrides: PEERCHAT_USER, PEERCHAT_ROOM, PEERCHAT_MODE, PEERCHAT_SERVICE,
/// PEERCHAT_PORT, PEERCHAT_SEEDS (`;`-separated), PEERCHAT_LAB_PEERS, PEERCHAT_DEBUG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Display name (empty: default_user).
    #[serde(default)]
    pub user: String,
    /// Room to join first (empty: default_room).
    #[serde(default)]
    pub room: String,
    /// Discovery mode: "provide" or "rendezvous" (default provide).
    #[serde(default)]
    pub mode: DiscoveryMode,
    /// Service name peers discover each other under.
    #[serde(default = "default_service")]
    pub service: String,
    /// Listen port (0 picks a free one).
    #[serde(default)]
    pub listen_port: u16,
    /// Extra bootstrap peers, `"<node id>@<ip:port>[,<ip:port>...]"`.
    #[serde(default)]
    pub seeds: Vec<String>,
    /// Companion nodes started in the local lab (default 2).
    #[serde(default = "default_lab_peers")]
    pub lab_peers: usize,
    /// Derive the identity from the listen port, so it is the same on every run.
    #[serde(default)]
    pub debug: bool,
    /// Engine timings, `[chat]` table.
    #[serde(default)]
    pub chat: ChatConfig,
}

fn default_service() -> String {
    DEFAULT_SERVICE.to_string()
}
fn default_lab_peers() -> usize {
    2
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: String::new(),
            room: String::new(),
            mode: DiscoveryMode::default(),
            service: default_service(),
            listen_port: 0,
            seeds: Vec::new(),
            lab_peers: default_lab_peers(),
            debug: false,
            chat: ChatConfig::default(),
        }
    }
}

impl Config {
    /// Identity seed: the listen port in debug mode, otherwise none (random identity).
    pub fn identity_seed(&self) -> Option<u64> {
        self.debug.then_some(u64::from(self.listen_port))
    }
}

/// Load config: default, then config file (`explicit` or the first standard path that
/// exists), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peerchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/peerchat/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    parse(&s).with_context(|| format!("parsing config file {}", path.display()))
}

fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

/// Apply `PEERCHAT_*` overrides. Values that don't parse are ignored.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("PEERCHAT_USER") {
        c.user = s;
    }
    if let Some(s) = var("PEERCHAT_ROOM") {
        c.room = s;
    }
    if let Some(mode) = var("PEERCHAT_MODE").and_then(|s| s.parse().ok()) {
        c.mode = mode;
    }
    if let Some(s) = var("PEERCHAT_SERVICE") {
        c.service = s;
    }
    if let Some(p) = var("PEERCHAT_PORT").and_then(|s| s.parse().ok()) {
        c.listen_port = p;
    }
    if let Some(s) = var("PEERCHAT_SEEDS") {
        c.seeds = s
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(n) = var("PEERCHAT_LAB_PEERS").and_then(|s| s.parse().ok()) {
        c.lab_peers = n;
    }
    if let Some(s) = var("PEERCHAT_DEBUG") {
        c.debug = matches!(s.trim(), "1" | "true" | "yes");
    }
}
