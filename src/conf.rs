//! Timeouts, block sizes and other knobs, gathered in one place the way
//! `mandreyel-cratetorrent/cratetorrent/src/conf.rs` does for the async
//! engine this crate adapts to a blocking-socket, OS-thread model.

use std::time::Duration;

pub const MAX_BLOCK_SIZE: u32 = 16 * 1024;
pub const MAX_BACKLOG: usize = 5;
pub const METADATA_CHUNK_SIZE: usize = 16 * 1024;
pub const TRACKER_INTERVAL_SECS: u64 = 1800;

/// Runtime-tunable subset of the above, plus the timeouts from spec.md §5.
#[derive(Debug, Clone)]
pub struct Conf {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub bitfield_timeout: Duration,
    pub message_timeout: Duration,
    pub tracker_ping_timeout: Duration,
    pub accept_poll_timeout: Duration,
    pub max_block_size: u32,
    pub max_backlog: usize,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1500),
            handshake_timeout: Duration::from_secs(7),
            bitfield_timeout: Duration::from_secs(10),
            message_timeout: Duration::from_secs(5),
            tracker_ping_timeout: Duration::from_secs(5),
            accept_poll_timeout: Duration::from_secs(1),
            max_block_size: MAX_BLOCK_SIZE,
            max_backlog: MAX_BACKLOG,
        }
    }
}
