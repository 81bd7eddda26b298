//! Bencoded request/response shapes for the tracker HTTP surface (§4.8).
//! Generalizes `jsondevers-bobby-bit/src/tracker/http.rs`'s
//! `AnnounceResponse`/`ScrapeResponse` pair, trimmed to the IPv4-only
//! compact peer encoding spec.md keeps (IPv6 compact encoding is an
//! explicit Non-goal) and shared between the client and server sides
//! instead of living only in the client module.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnnounceResponse {
    #[serde(rename = "failure reason", skip_serializing_if = "Option::is_none", default)]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub complete: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub incomplete: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub peers: Option<ByteBuf>,
}

impl AnnounceResponse {
    pub fn failure(reason: impl Into<String>) -> Self {
        AnnounceResponse {
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn peer_addrs(&self) -> Vec<SocketAddrV4> {
        self.peers
            .as_ref()
            .map(|b| decode_compact_peers(b))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeFile {
    pub complete: u64,
    pub incomplete: u64,
    pub downloaded: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScrapeResponse {
    pub files: HashMap<ByteBuf, ScrapeFile>,
}

/// `<4-byte IPv4><2-byte BE port>` concatenated for every peer (§4.8).
pub fn encode_compact_peers(addrs: &[SocketAddrV4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(addrs.len() * 6);
    for addr in addrs {
        out.extend_from_slice(&addr.ip().octets());
        out.extend_from_slice(&addr.port().to_be_bytes());
    }
    out
}

pub fn decode_compact_peers(bytes: &[u8]) -> Vec<SocketAddrV4> {
    bytes
        .chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect()
}
