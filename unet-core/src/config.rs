//! Context configuration.

use serde::Deserialize;

use crate::protocol::MAX_APP_CHANNELS;

/// Tunables for one `Context`. All fields have defaults so a partial TOML table works.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContextConfig {
    /// Number of application channels (default 1).
    pub channels: u8,
    /// Bytes per file transfer chunk (default 16 KiB).
    pub file_chunk_size: usize,
    /// File chunks sent per transfer per tick (default 1).
    pub file_chunks_per_tick: usize,
    /// Display name; falls back to the primary service's user name.
    pub persona: Option<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            file_chunk_size: 16 * 1024,
            file_chunks_per_tick: 1,
            persona: None,
        }
    }
}

impl ContextConfig {
    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = channels;
        self
    }

    /// Clamp out-of-range values.
    pub fn normalized(mut self) -> Self {
        self.channels = self.channels.clamp(1, MAX_APP_CHANNELS);
        self.file_chunk_size = self.file_chunk_size.max(1);
        self.file_chunks_per_tick = self.file_chunks_per_tick.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ContextConfig::default();
        assert_eq!(c.channels, 1);
        assert_eq!(c.file_chunk_size, 16384);
        assert_eq!(c.file_chunks_per_tick, 1);
        assert!(c.persona.is_none());
    }

    #[test]
    fn normalized_clamps() {
        let c = ContextConfig {
            channels: 0,
            file_chunk_size: 0,
            file_chunks_per_tick: 0,
            persona: None,
        }
        .normalized();
        assert_eq!((c.channels, c.file_chunk_size, c.file_chunks_per_tick), (1, 1, 1));
        assert_eq!(ContextConfig::default().with_channels(255).normalized().channels, MAX_APP_CHANNELS);
    }
}
