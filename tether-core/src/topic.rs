//! Rendezvous topic and its base58 "Server ID" rendering.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Byte length of an overlay topic.
pub const TOPIC_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum TopicError {
    #[error("server id is not valid base58")]
    Encoding(#[from] bs58::decode::Error),
    #[error("server id must decode to exactly {TOPIC_LEN} bytes, got {0}")]
    Length(usize),
}

/// A 32-byte overlay rendezvous topic.
///
/// Shared out-of-band as a base58 Server ID; possession of the topic is the
/// only discovery mechanism. There is no directory or account layer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic([u8; TOPIC_LEN]);

impl Topic {
    /// A fresh random topic. Hosts mint one per run; nothing persists
    /// across restarts.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; TOPIC_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TOPIC_LEN] {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({self})")
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec()?;
        let len = bytes.len();
        let bytes: [u8; TOPIC_LEN] = bytes.try_into().map_err(|_| TopicError::Length(len))?;
        Ok(Self(bytes))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
