//! Peer-to-piece exchange engine and HTTP tracker for a BitTorrent-style
//! distribution protocol: wire framing and handshake (`wire`), torrent
//! and magnet parsing (`metainfo`), the per-connection state machine
//! (`peer`), the download/upload engines and file assembler (`engine`),
//! the tracker's registry and HTTP surface (`tracker`), and the
//! process-level lifecycle controller (`client`).

pub mod bitfield;
pub mod client;
pub mod conf;
pub mod engine;
pub mod error;
pub mod metainfo;
pub mod peer;
pub mod tracker;
pub mod wire;

pub use error::{BtError, Result};
