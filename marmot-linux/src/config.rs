//! Load config from file and environment.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::connection::{ConnectionConfig, DEFAULT_PORT, DEFAULT_SUBSCRIBER_CAPACITY};
use marmot_core::wire::DEFAULT_MAX_LINE_BYTES;

/// Link configuration. File: ~/.config/marmot/config.toml or /etc/marmot/config.toml.
/// Env overrides: MARMOT_PORT, MARMOT_BIND, MARMOT_NAME, MARMOT_CONNECT_TIMEOUT_SECS,
/// MARMOT_ACCEPT_TIMEOUT_SECS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP port to listen on or dial (default 9898).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address the host binds to (default 0.0.0.0).
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    /// Name announced in `Hello` (default "marmot").
    #[serde(default = "default_name")]
    pub name: String,
    /// Give up dialing after this many seconds. Unset: no limit.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    /// Give up waiting for a peer after this many seconds. Unset: no limit.
    #[serde(default)]
    pub accept_timeout_secs: Option<u64>,
    /// Per-subscriber buffer, in messages (default 64).
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
    /// Longest accepted inbound line (default 65536).
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}
fn default_name() -> String {
    "marmot".to_string()
}
fn default_subscriber_capacity() -> usize {
    DEFAULT_SUBSCRIBER_CAPACITY
}
fn default_max_line_bytes() -> usize {
    DEFAULT_MAX_LINE_BYTES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            name: default_name(),
            connect_timeout_secs: None,
            accept_timeout_secs: None,
            subscriber_capacity: default_subscriber_capacity(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl Config {
    /// Settings for the connection manager.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            bind_ip: self.bind,
            accept_timeout: self.accept_timeout_secs.map(Duration::from_secs),
            connect_timeout: self.connect_timeout_secs.map(Duration::from_secs),
            subscriber_capacity: self.subscriber_capacity,
            max_line_bytes: self.max_line_bytes,
        }
    }
}

/// Load config: defaults, then the config file (explicit path, else the first
/// standard location that exists), then env vars.
pub fn load(explicit: Option<&Path>) -> Config {
    let mut c = match explicit {
        Some(path) => load_file(path).unwrap_or_default(),
        None => config_paths()
            .into_iter()
            .find(|p| p.exists())
            .and_then(|p| load_file(&p))
            .unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Apply `MARMOT_*` overrides read through `var`. Unparseable values are ignored.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = parsed(&var, "MARMOT_PORT") {
        c.port = p;
    }
    if let Some(ip) = parsed(&var, "MARMOT_BIND") {
        c.bind = ip;
    }
    if let Some(name) = var("MARMOT_NAME").filter(|n| !n.trim().is_empty()) {
        c.name = name;
    }
    if let Some(secs) = parsed(&var, "MARMOT_CONNECT_TIMEOUT_SECS") {
        c.connect_timeout_secs = Some(secs);
    }
    if let Some(secs) = parsed(&var, "MARMOT_ACCEPT_TIMEOUT_SECS") {
        c.accept_timeout_secs = Some(secs);
    }
}

fn parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/marmot/config.toml"));
    }
    out.push(PathBuf::from("/etc/marmot/config.toml"));
    out
}

fn load_file(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config file, using defaults");
            return None;
        }
    };
    match toml::from_str::<Config>(&s) {
        Ok(c) => {
            debug!(path = %path.display(), "loaded config");
            Some(c)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
            None
        }
    }
}
