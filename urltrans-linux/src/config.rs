//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use urltrans_core::SessionConfig;

/// Fetcher configuration. File: ~/.config/urltrans/config.toml or /etc/urltrans/config.toml.
/// Env overrides: URLTRANS_URL, URLTRANS_OUTPUT, URLTRANS_STORE_BYTES,
/// URLTRANS_RECONNECT_TIMEOUT, URLTRANS_CONNECT_TIMEOUT, URLTRANS_MAX_RECONNECTS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Stream URL used when none is given on the command line.
    #[serde(default)]
    pub url: Option<String>,
    /// Output path; "-" is stdout.
    #[serde(default = "default_output")]
    pub output: String,
    /// Number of consumer buffers (default 4).
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
    /// Bytes per consumer buffer (default 16 KiB).
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,
    /// Consecutive reconnection attempts before giving up; 0 retries forever.
    #[serde(default)]
    pub max_reconnects: u32,
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_output() -> String {
    "-".to_string()
}
fn default_buffer_count() -> usize {
    4
}
fn default_buffer_size() -> usize {
    16 * 1024
}
fn default_auto_reconnect() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: None,
            output: default_output(),
            buffer_count: default_buffer_count(),
            buffer_size: default_buffer_size(),
            auto_reconnect: default_auto_reconnect(),
            max_reconnects: 0,
            session: SessionConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("URLTRANS_URL") {
        c.url = Some(s);
    }
    if let Some(s) = var("URLTRANS_OUTPUT") {
        c.output = s;
    }
    if let Some(s) = var("URLTRANS_STORE_BYTES") {
        if let Ok(n) = s.parse::<usize>() {
            c.session.store_bytes = n;
        }
    }
    if let Some(s) = var("URLTRANS_RECONNECT_TIMEOUT") {
        if let Ok(secs) = s.parse::<f64>() {
            c.session.reconnect_timeout = secs;
        }
    }
    if let Some(s) = var("URLTRANS_CONNECT_TIMEOUT") {
        if let Ok(secs) = s.parse::<u64>() {
            c.session.connect_timeout = secs;
        }
    }
    if let Some(s) = var("URLTRANS_MAX_RECONNECTS") {
        if let Ok(n) = s.parse::<u32>() {
            c.max_reconnects = n;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/urltrans/config.toml"));
    }
    out.push(PathBuf::from("/etc/urltrans/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| toml::from_str::<Config>(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config file"),
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}
