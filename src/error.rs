//! Typed error kinds shared by every component (§7).

use std::fmt;

/// The 20-byte identity mismatch that comes up in a few different error
/// shapes (piece hash, metadata hash); kept as a pair of arrays rather
/// than a `Vec` so `BtError` stays `Copy`-free but allocation-free.
pub type Digest = [u8; 20];

#[derive(Debug, thiserror::Error)]
pub enum BtError {
    /// Framing violation, unexpected message id, handshake mismatch.
    /// Closes the offending session; never fatal to the engine unless it
    /// occurs for every peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// SHA-1 mismatch on a piece or on assembled metadata.
    #[error("integrity error: expected {}, got {}", hex(expected), hex(actual))]
    Integrity { expected: Digest, actual: Digest },

    /// Connect failure, read/write failure, timeout.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Non-200 response or a `failure reason` field in the bencoded body.
    #[error("tracker error: {0}")]
    Tracker(String),

    /// Malformed torrent, invalid magnet, unsupported tracker.
    #[error("configuration error: {0}")]
    Config(String),
}

fn hex(bytes: &Digest) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl BtError {
    pub fn protocol(msg: impl fmt::Display) -> Self {
        BtError::Protocol(msg.to_string())
    }

    pub fn config(msg: impl fmt::Display) -> Self {
        BtError::Config(msg.to_string())
    }

    pub fn tracker(msg: impl fmt::Display) -> Self {
        BtError::Tracker(msg.to_string())
    }

    pub fn integrity(expected: Digest, actual: Digest) -> Self {
        BtError::Integrity { expected, actual }
    }

    /// True for the error kinds that §7 says are absorbed by re-queueing
    /// work and rotating peers, rather than tearing down the engine.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BtError::Protocol(_) | BtError::Integrity { .. } | BtError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BtError>;
