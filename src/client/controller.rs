//! Per-process controller owning the local `PeerId` and the set of
//! active torrents (§4.9), grounded on
//! `original_source/client/client_node.py ClientNode`: one `TorrentHandle`
//! per torrent, each holding the worker `JoinHandle`s and the
//! `Arc<AtomicBool>` stop flag it shares with its engine — the same
//! struct-of-handles shape `jsondevers-bobby-bit/src/peer/connection.rs
//! spawn_peer` uses for a single connection, generalized here to a
//! whole torrent's worker set.

use crate::conf::Conf;
use crate::engine::{Assembler, DownloadEngine, Piece, UploadEngine};
use crate::error::{BtError, Result};
use crate::metainfo::{InfoHash, Magnet, Metainfo, PeerId};
use crate::peer::metadata::fetch_metainfo;
use crate::tracker::client::{self, AnnounceEvent, AnnounceParams};
use log::{info, warn};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Downloading,
    Seeding,
}

#[derive(Debug, Clone, Copy)]
pub struct Status {
    pub pieces_done: usize,
    pub pieces_total: usize,
    pub role: Role,
}

struct TorrentHandle {
    tracker_url: String,
    stop: Arc<AtomicBool>,
    verified: Arc<AtomicUsize>,
    pieces_total: usize,
    role: Role,
    workers: Vec<JoinHandle<()>>,
}

pub struct Controller {
    pub peer_id: PeerId,
    conf: Conf,
    torrents: Mutex<HashMap<InfoHash, TorrentHandle>>,
}

impl Controller {
    pub fn new(conf: Conf) -> Self {
        Controller {
            peer_id: PeerId::generate(),
            conf,
            torrents: Mutex::new(HashMap::new()),
        }
    }

    /// Announces `started`, spawns the download engine in the
    /// background, and announces `completed` once every piece verifies.
    pub fn download(&self, metainfo: Metainfo, download_dir: &Path, port: u16) -> Result<()> {
        let info_hash = metainfo.info_hash();
        let tracker_url = metainfo.announce_url()?.to_string();
        let total_length = metainfo.total_length();

        let response = client::announce(
            &tracker_url,
            &AnnounceParams {
                info_hash,
                peer_id: self.peer_id,
                port,
                uploaded: 0,
                downloaded: 0,
                left: total_length,
                event: AnnounceEvent::Started,
            },
            &self.conf,
        )?;
        let peer_addrs: Vec<SocketAddr> = response.peer_addrs().into_iter().map(SocketAddr::V4).collect();

        let assembler = Arc::new(Assembler::create(download_dir, &metainfo.files(), metainfo.piece_length())?);
        let pieces: Vec<Piece> = metainfo
            .piece_hashes()
            .into_iter()
            .enumerate()
            .map(|(index, hash)| Piece { index, length: metainfo.piece_len(index) as u32, hash })
            .collect();
        let pieces_total = pieces.len();

        let stop = Arc::new(AtomicBool::new(false));
        let verified = Arc::new(AtomicUsize::new(0));
        let engine = DownloadEngine::new(info_hash, self.peer_id, pieces_total, self.conf.clone());

        let worker = {
            let stop = Arc::clone(&stop);
            let verified = Arc::clone(&verified);
            let tracker_url = tracker_url.clone();
            let peer_id = self.peer_id;
            let conf = self.conf.clone();
            thread::spawn(move || {
                let done = engine.run(peer_addrs, pieces, assembler, Arc::clone(&stop), verified);
                if done >= pieces_total {
                    let result = client::announce(
                        &tracker_url,
                        &AnnounceParams {
                            info_hash,
                            peer_id,
                            port,
                            uploaded: 0,
                            downloaded: total_length,
                            left: 0,
                            event: AnnounceEvent::Completed,
                        },
                        &conf,
                    );
                    if let Err(e) = result {
                        warn!("completed announce for {info_hash} failed: {e}");
                    }
                    info!("torrent {info_hash} finished downloading");
                } else {
                    warn!("torrent {info_hash} stopped with {done}/{pieces_total} pieces verified");
                }
            })
        };

        self.torrents.lock().unwrap().insert(
            info_hash,
            TorrentHandle {
                tracker_url,
                stop,
                verified,
                pieces_total,
                role: Role::Downloading,
                workers: vec![worker],
            },
        );
        Ok(())
    }

    /// Resolves a magnet link to a full `Metainfo` by announcing to its
    /// tracker for a peer list, then pulling `info` from the first peer
    /// that speaks the extension sub-protocol (§4.6), before handing off
    /// to [`Controller::download`].
    pub fn download_magnet(&self, magnet: &Magnet, download_dir: &Path, port: u16) -> Result<()> {
        let response = client::announce(
            magnet.primary_tracker(),
            &AnnounceParams {
                info_hash: magnet.info_hash,
                peer_id: self.peer_id,
                port,
                uploaded: 0,
                downloaded: 0,
                left: 0,
                event: AnnounceEvent::Started,
            },
            &self.conf,
        )?;

        let metainfo = response
            .peer_addrs()
            .into_iter()
            .map(SocketAddr::V4)
            .find_map(|addr| fetch_metainfo(addr, magnet.info_hash, self.peer_id, &self.conf).ok())
            .ok_or_else(|| BtError::protocol("no peer offered metadata for this magnet link"))?;

        self.download(metainfo, download_dir, port)
    }

    /// Announces `started` and serves the already-complete files under
    /// `root` to whoever connects (§4.7, §4.9).
    pub fn seed(&self, metainfo: Metainfo, root: &Path, port: u16) -> Result<()> {
        let info_hash = metainfo.info_hash();
        let tracker_url = metainfo.announce_url()?.to_string();

        client::announce(
            &tracker_url,
            &AnnounceParams {
                info_hash,
                peer_id: self.peer_id,
                port,
                uploaded: 0,
                downloaded: metainfo.total_length(),
                left: 0,
                event: AnnounceEvent::Started,
            },
            &self.conf,
        )?;

        let assembler = Arc::new(Assembler::create(root, &metainfo.files(), metainfo.piece_length())?);
        let num_pieces = metainfo.num_pieces();
        let mut bitfield = crate::bitfield::Bitfield::new(num_pieces);
        for i in 0..num_pieces {
            bitfield.set(i);
        }

        let listener = TcpListener::bind(("0.0.0.0", port))?;
        let engine = UploadEngine::new(
            info_hash,
            self.peer_id,
            bitfield,
            metainfo.piece_length(),
            num_pieces,
            metainfo.info_bytes(),
            assembler,
            self.conf.clone(),
        );

        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                if let Err(e) = engine.serve(listener, stop) {
                    warn!("upload engine for {info_hash} exited: {e}");
                }
            })
        };

        self.torrents.lock().unwrap().insert(
            info_hash,
            TorrentHandle {
                tracker_url,
                stop,
                verified: Arc::new(AtomicUsize::new(num_pieces)),
                pieces_total: num_pieces,
                role: Role::Seeding,
                workers: vec![worker],
            },
        );
        Ok(())
    }

    /// Sets the stop flag, joins every worker thread (bounded by the
    /// accept/read timeouts in §5), and announces `stopped`.
    pub fn stop(&self, info_hash: InfoHash) -> Result<()> {
        let handle = self
            .torrents
            .lock()
            .unwrap()
            .remove(&info_hash)
            .ok_or_else(|| BtError::config("no such torrent"))?;

        handle.stop.store(true, Ordering::SeqCst);
        for worker in handle.workers {
            let _ = worker.join();
        }

        client::announce(
            &handle.tracker_url,
            &AnnounceParams {
                info_hash,
                peer_id: self.peer_id,
                port: 0,
                uploaded: 0,
                downloaded: 0,
                left: 0,
                event: AnnounceEvent::Stopped,
            },
            &self.conf,
        )?;
        Ok(())
    }

    pub fn status(&self, info_hash: InfoHash) -> Result<Status> {
        let torrents = self.torrents.lock().unwrap();
        let handle = torrents.get(&info_hash).ok_or_else(|| BtError::config("no such torrent"))?;
        Ok(Status {
            pieces_done: handle.verified.load(Ordering::SeqCst),
            pieces_total: handle.pieces_total,
            role: handle.role,
        })
    }

    pub fn active_torrents(&self) -> Vec<InfoHash> {
        self.torrents.lock().unwrap().keys().copied().collect()
    }
}

/// Loads a `.torrent` file and its target directory the way the CLI's
/// `download`/`seed` subcommands expect (§6).
pub fn load_metainfo(path: &Path) -> Result<Metainfo> {
    Metainfo::from_file(path)
}

pub fn resolve_download_dir(download_dir: Option<&Path>) -> PathBuf {
    download_dir.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."))
}
