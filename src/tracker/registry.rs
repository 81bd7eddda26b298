//! In-memory peer registry (§4.8, §3 `TrackerRegistry` invariant): a
//! `HashMap<InfoHash, HashMap<PeerId, PeerEntry>>` behind a single lock,
//! matching `original_source/tracker/client_list.py ClientList`'s one
//! dict-of-dicts behind one `threading.Lock` — generalized from
//! `jsondevers-bobby-bit`, which had no server-side registry at all.

use crate::metainfo::{InfoHash, PeerId};
use crate::tracker::wire::ScrapeFile;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

impl PeerEntry {
    fn is_seeder(&self) -> bool {
        self.left == 0
    }
}

#[derive(Default)]
struct Inner {
    peers: HashMap<InfoHash, HashMap<PeerId, PeerEntry>>,
    /// Running count of `completed` events ever announced per torrent,
    /// the scrape response's `downloaded` field.
    completed_totals: HashMap<InfoHash, u64>,
}

#[derive(Default)]
pub struct TrackerRegistry {
    inner: Mutex<Inner>,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `started`/missing-event/`completed` announce: upsert the entry.
    /// `just_completed` increments the scrape `downloaded` counter.
    pub fn update_peer(
        &self,
        info_hash: InfoHash,
        peer_id: PeerId,
        entry: PeerEntry,
        just_completed: bool,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .peers
            .entry(info_hash)
            .or_default()
            .insert(peer_id, entry);
        if just_completed {
            *inner.completed_totals.entry(info_hash).or_insert(0) += 1;
        }
    }

    /// `stopped` with `info_hash`: remove just that entry.
    pub fn remove_peer(&self, info_hash: InfoHash, peer_id: PeerId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(torrent) = inner.peers.get_mut(&info_hash) {
            torrent.remove(&peer_id);
        }
    }

    /// `stopped` without `info_hash`: remove the peer from every torrent
    /// (`ClientList.remove_peer_from_all`).
    pub fn remove_peer_from_all(&self, peer_id: PeerId) {
        let mut inner = self.inner.lock().unwrap();
        for torrent in inner.peers.values_mut() {
            torrent.remove(&peer_id);
        }
    }

    /// Peers registered for `info_hash` other than `excluding`, plus the
    /// seeder/leecher counts (§4.8 response `complete`/`incomplete`).
    pub fn peers_excluding(&self, info_hash: InfoHash, excluding: PeerId) -> (Vec<(Ipv4Addr, u16)>, u64, u64) {
        let inner = self.inner.lock().unwrap();
        let Some(torrent) = inner.peers.get(&info_hash) else {
            return (Vec::new(), 0, 0);
        };
        let complete = torrent.values().filter(|p| p.is_seeder()).count() as u64;
        let incomplete = torrent.len() as u64 - complete;
        let addrs = torrent
            .iter()
            .filter(|(id, _)| **id != excluding)
            .map(|(_, e)| (e.ip, e.port))
            .collect();
        (addrs, complete, incomplete)
    }

    /// `GET /scrape`: stats for one torrent. A missing `info_hash` yields
    /// an empty files mapping rather than stats for every known torrent
    /// (DESIGN.md Open Question).
    pub fn scrape(&self, info_hash: Option<InfoHash>) -> HashMap<InfoHash, ScrapeFile> {
        let inner = self.inner.lock().unwrap();
        let Some(info_hash) = info_hash else {
            return HashMap::new();
        };
        let Some(torrent) = inner.peers.get(&info_hash) else {
            return HashMap::new();
        };
        let complete = torrent.values().filter(|p| p.is_seeder()).count() as u64;
        let incomplete = torrent.len() as u64 - complete;
        let downloaded = inner.completed_totals.get(&info_hash).copied().unwrap_or(0);
        let mut out = HashMap::new();
        out.insert(info_hash, ScrapeFile { complete, incomplete, downloaded });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(left: u64) -> PeerEntry {
        PeerEntry {
            ip: Ipv4Addr::new(127, 0, 0, 1),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left,
        }
    }

    #[test]
    fn stopped_without_info_hash_removes_from_every_torrent() {
        let reg = TrackerRegistry::new();
        let peer = PeerId([1; 20]);
        let a = InfoHash([0xaa; 20]);
        let b = InfoHash([0xbb; 20]);
        reg.update_peer(a, peer, entry(100), false);
        reg.update_peer(b, peer, entry(100), false);

        reg.remove_peer_from_all(peer);

        assert!(reg.peers_excluding(a, PeerId([9; 20])).0.is_empty());
        assert!(reg.peers_excluding(b, PeerId([9; 20])).0.is_empty());
    }

    #[test]
    fn scrape_without_info_hash_is_empty() {
        let reg = TrackerRegistry::new();
        reg.update_peer(InfoHash([1; 20]), PeerId([1; 20]), entry(0), false);
        assert!(reg.scrape(None).is_empty());
    }

    #[test]
    fn excludes_requesting_peer_and_counts_seeders() {
        let reg = TrackerRegistry::new();
        let info_hash = InfoHash([1; 20]);
        let seeder = PeerId([1; 20]);
        let leecher = PeerId([2; 20]);
        reg.update_peer(info_hash, seeder, entry(0), true);
        reg.update_peer(info_hash, leecher, entry(500), false);

        let (addrs, complete, incomplete) = reg.peers_excluding(info_hash, seeder);
        assert_eq!(addrs.len(), 1);
        assert_eq!(complete, 1);
        assert_eq!(incomplete, 1);

        let scraped = reg.scrape(Some(info_hash));
        let file = &scraped[&info_hash];
        assert_eq!(file.complete, 1);
        assert_eq!(file.incomplete, 1);
        assert_eq!(file.downloaded, 1);
    }
}
