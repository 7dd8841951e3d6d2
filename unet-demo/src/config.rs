//! Load demo settings from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Demo configuration. File: ~/.config/unet/demo.toml or /etc/unet/demo.toml.
/// Env overrides: UNET_CHANNELS, UNET_CHUNK_SIZE, UNET_PACKET_LIMIT, UNET_CLIENTS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DemoConfig {
    /// Application channels per context (default 2).
    #[serde(default = "default_channels")]
    pub channels: u8,
    /// File transfer chunk size in bytes (default 16 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Reliable packet limit of the simulated Galaxy network (default 1200, 0 = unlimited).
    #[serde(default = "default_packet_limit")]
    pub packet_limit: usize,
    /// Clients joining the host, alternating between Steam and Galaxy (default 2, min 2).
    #[serde(default = "default_clients")]
    pub clients: usize,
}

fn default_channels() -> u8 {
    2
}
fn default_chunk_size() -> usize {
    16 * 1024
}
fn default_packet_limit() -> usize {
    1200
}
fn default_clients() -> usize {
    2
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            chunk_size: default_chunk_size(),
            packet_limit: default_packet_limit(),
            clients: default_clients(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> DemoConfig {
    let mut c = load_file().unwrap_or_default();
    if let Some(v) = env_parse::<u8>("UNET_CHANNELS") {
        c.channels = v;
    }
    if let Some(v) = env_parse::<usize>("UNET_CHUNK_SIZE") {
        c.chunk_size = v;
    }
    if let Some(v) = env_parse::<usize>("UNET_PACKET_LIMIT") {
        c.packet_limit = v;
    }
    if let Some(v) = env_parse::<usize>("UNET_CLIENTS") {
        c.clients = v;
    }
    c.clients = c.clients.clamp(2, 64);
    if c.packet_limit != 0 {
        c.packet_limit = c.packet_limit.max(64);
    }
    c
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/unet/demo.toml"));
    }
    out.push(PathBuf::from("/etc/unet/demo.toml"));
    out
}

fn load_file() -> Option<DemoConfig> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<DemoConfig>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let c: DemoConfig = toml::from_str("clients = 4").unwrap();
        assert_eq!(c.clients, 4);
        assert_eq!(c.channels, 2);
        assert_eq!(c.packet_limit, 1200);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<DemoConfig>("proxy_port = 1").is_err());
    }
}
