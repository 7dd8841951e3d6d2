//! Session identity: the GUID that names a member across reconnects and transports.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identifier for a lobby or a lobby member.
/// Stable across transports, so it is how the host stitches together the
/// several `ServiceId`s a single member connects with.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Guid(Uuid);

impl Guid {
    /// Generate a new random (v4) GUID.
    pub fn new() -> Self {
        Guid(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Guid(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Guid(Uuid::from_bytes(bytes))
    }
}

impl Default for Guid {
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for Guid {
    type Err = GuidParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Guid)
            .map_err(|_| GuidParseError(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid guid: {0:?}")]
pub struct GuidParseError(String);
