//! Hand-rolled HTTP surface for `/announce`, `/scrape`, `/ping` (§4.8):
//! `std::net::TcpListener` plus `httparse`, one thread per connection,
//! matching `original_source/tracker/tracker_server.py`'s choice of a
//! thread-per-request stdlib `HTTPServer` rather than an async framework,
//! so the whole crate keeps one concurrency model (§5). `httparse` was a
//! declared but unused teacher dependency before this module.

use crate::conf::{Conf, TRACKER_INTERVAL_SECS};
use crate::metainfo::{InfoHash, PeerId};
use crate::tracker::registry::{PeerEntry, TrackerRegistry};
use crate::tracker::wire::{encode_compact_peers, AnnounceResponse, ScrapeResponse};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub struct TrackerServer {
    registry: Arc<TrackerRegistry>,
    conf: Conf,
}

impl TrackerServer {
    pub fn new(registry: Arc<TrackerRegistry>, conf: Conf) -> Self {
        TrackerServer { registry, conf }
    }

    /// Runs the accept loop until `stop` is set, handling each connection
    /// on its own thread. Non-blocking accept + short poll sleep stands
    /// in for a listener read timeout, which `std::net::TcpListener`
    /// doesn't expose directly.
    pub fn serve(&self, listener: TcpListener, stop: Arc<AtomicBool>) -> std::io::Result<()> {
        listener.set_nonblocking(true)?;
        info!("tracker listening on {}", listener.local_addr()?);

        loop {
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    let registry = Arc::clone(&self.registry);
                    let conf = self.conf.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_connection(stream, &registry, &conf) {
                            debug!("tracker connection from {peer_addr} failed: {e}");
                        }
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(self.conf.accept_poll_timeout);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, registry: &TrackerRegistry, conf: &Conf) -> std::io::Result<()> {
    stream.set_read_timeout(Some(conf.message_timeout))?;
    stream.set_write_timeout(Some(conf.message_timeout))?;

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    let header_end = loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > 8192 {
            return write_status(&mut stream, 400, "request too large");
        }
    };
    let _ = header_end;

    let mut headers = [httparse::EMPTY_HEADER; 16];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(&buf) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return write_status(&mut stream, 400, "malformed request"),
    }

    let Some(path_and_query) = req.path else {
        return write_status(&mut stream, 400, "missing path");
    };
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, q.as_bytes()),
        None => (path_and_query, &[][..]),
    };
    let params = parse_query(query);

    let body = match path {
        "/announce" => handle_announce(registry, &params, stream.peer_addr()?.ip()),
        "/scrape" => handle_scrape(registry, &params),
        "/ping" => return handle_ping(&mut stream, &params, conf),
        other => {
            warn!("tracker: unknown path {other}");
            return write_status(&mut stream, 404, "not found");
        }
    };

    write_body(&mut stream, &body)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_query(query: &[u8]) -> HashMap<String, Vec<u8>> {
    let mut map = HashMap::new();
    for pair in query.split(|&b| b == b'&') {
        if pair.is_empty() {
            continue;
        }
        let mut parts = pair.splitn(2, |&b| b == b'=');
        let key = parts.next().unwrap_or(&[]);
        let value = parts.next().unwrap_or(&[]);
        let key = String::from_utf8_lossy(key).into_owned();
        let decoded = urlencoding::decode_binary(value).into_owned();
        map.insert(key, decoded);
    }
    map
}

fn as_str<'a>(params: &'a HashMap<String, Vec<u8>>, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| std::str::from_utf8(v).ok())
}

fn as_u64(params: &HashMap<String, Vec<u8>>, key: &str) -> Option<u64> {
    as_str(params, key)?.parse().ok()
}

fn handle_announce(registry: &TrackerRegistry, params: &HashMap<String, Vec<u8>>, source_ip: std::net::IpAddr) -> Vec<u8> {
    let Some(peer_id_bytes) = params.get("peer_id") else {
        return bencode(&AnnounceResponse::failure("missing peer_id"));
    };
    let Ok(peer_id) = PeerId::from_bytes(peer_id_bytes) else {
        return bencode(&AnnounceResponse::failure("peer_id must be exactly 20 bytes"));
    };
    let Some(port) = as_u64(params, "port") else {
        return bencode(&AnnounceResponse::failure("missing port"));
    };

    // `info_hash` is handled as optional below so a bare `stopped` event
    // (no info_hash) still reaches `remove_peer_from_all`, matching
    // `original_source/tracker/tracker_server.py handle_announce`, which
    // only requires `peer_id`/`port` up front and treats `info_hash` as
    // present-or-absent from here on.
    let info_hash = match params.get("info_hash") {
        Some(bytes) => match InfoHash::from_bytes(bytes) {
            Ok(hash) => Some(hash),
            Err(_) => return bencode(&AnnounceResponse::failure("info_hash must be exactly 20 bytes")),
        },
        None => None,
    };

    let event = as_str(params, "event").unwrap_or("");
    let ip = match source_ip {
        std::net::IpAddr::V4(v4) => v4,
        std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
    };

    match event {
        "stopped" => match info_hash {
            Some(info_hash) => registry.remove_peer(info_hash, peer_id),
            None => registry.remove_peer_from_all(peer_id),
        },
        _ => {
            if let Some(info_hash) = info_hash {
                let entry = PeerEntry {
                    ip,
                    port: port as u16,
                    uploaded: as_u64(params, "uploaded").unwrap_or(0),
                    downloaded: as_u64(params, "downloaded").unwrap_or(0),
                    left: as_u64(params, "left").unwrap_or(0),
                };
                registry.update_peer(info_hash, peer_id, entry, event == "completed");
            }
        }
    }

    let Some(info_hash) = info_hash else {
        return bencode(&AnnounceResponse::failure("missing info_hash"));
    };

    let (addrs, complete, incomplete) = registry.peers_excluding(info_hash, peer_id);
    let compact: Vec<SocketAddrV4> = addrs.into_iter().map(|(ip, port)| SocketAddrV4::new(ip, port)).collect();
    bencode(&AnnounceResponse {
        failure_reason: None,
        interval: Some(TRACKER_INTERVAL_SECS),
        complete: Some(complete),
        incomplete: Some(incomplete),
        peers: Some(serde_bytes::ByteBuf::from(encode_compact_peers(&compact))),
    })
}

fn handle_scrape(registry: &TrackerRegistry, params: &HashMap<String, Vec<u8>>) -> Vec<u8> {
    let info_hash = params
        .get("info_hash")
        .and_then(|b| InfoHash::from_bytes(b).ok());
    let files = registry
        .scrape(info_hash)
        .into_iter()
        .map(|(hash, file)| (serde_bytes::ByteBuf::from(hash.as_bytes().to_vec()), file))
        .collect();
    bencode(&ScrapeResponse { files })
}

fn handle_ping(stream: &mut TcpStream, params: &HashMap<String, Vec<u8>>, conf: &Conf) -> std::io::Result<()> {
    let Some(ip) = as_str(params, "peer_ip") else {
        return write_status(stream, 400, "missing peer_ip");
    };
    let Some(port) = as_str(params, "peer_port").and_then(|p| p.parse::<u16>().ok()) else {
        return write_status(stream, 400, "missing peer_port");
    };

    let alive = ping_peer(ip, port, conf.tracker_ping_timeout).unwrap_or(false);
    write_body(stream, format!("{{\"alive\": {alive}}}").as_bytes())
}

/// Opens a TCP connection to the peer, sends `"ping"`, expects `"pong"`
/// within `timeout` — matches `tracker_server.py handle_ping` verbatim.
fn ping_peer(ip: &str, port: u16, timeout: Duration) -> std::io::Result<bool> {
    let addr: std::net::SocketAddr = format!("{ip}:{port}").parse().map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid peer address")
    })?;
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(b"ping")?;

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(&buf == b"pong")
}

fn bencode(value: &impl serde::Serialize) -> Vec<u8> {
    serde_bencode::to_bytes(value).expect("tracker response serializes infallibly")
}

fn write_body(stream: &mut TcpStream, body: &[u8]) -> std::io::Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)
}

fn write_status(stream: &mut TcpStream, code: u16, reason: &str) -> std::io::Result<()> {
    let header = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        reason.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(reason.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdTcpStream;

    fn spawn_server() -> (SocketAddrV4, Arc<AtomicBool>, Arc<TrackerRegistry>) {
        let registry = Arc::new(TrackerRegistry::new());
        let stop = Arc::new(AtomicBool::new(false));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = match listener.local_addr().unwrap() {
            std::net::SocketAddr::V4(v4) => v4,
            _ => unreachable!(),
        };
        let server = TrackerServer::new(Arc::clone(&registry), Conf::default());
        let stop_clone = Arc::clone(&stop);
        thread::spawn(move || {
            let _ = server.serve(listener, stop_clone);
        });
        (addr, stop, registry)
    }

    #[test]
    fn announce_with_missing_info_hash_is_a_failure_response() {
        let (addr, stop, _registry) = spawn_server();
        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET /announce?peer_id=aaaaaaaaaaaaaaaaaaaa&port=6881 HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let mut resp = Vec::new();
        stream.read_to_end(&mut resp).unwrap();
        let body = split_body(&resp);
        let decoded: AnnounceResponse = serde_bencode::from_bytes(body).unwrap();
        assert!(decoded.failure_reason.is_some());
        stop.store(true, Ordering::SeqCst);
    }

    #[test]
    fn bare_stopped_event_removes_peer_from_every_torrent() {
        let (addr, stop, registry) = spawn_server();
        let peer_id = PeerId::from_bytes(b"aaaaaaaaaaaaaaaaaaaa").unwrap();
        let info_hash = InfoHash([7; 20]);
        registry.update_peer(
            info_hash,
            peer_id,
            PeerEntry { ip: Ipv4Addr::new(127, 0, 0, 1), port: 6881, uploaded: 0, downloaded: 0, left: 100 },
            false,
        );

        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET /announce?peer_id=aaaaaaaaaaaaaaaaaaaa&port=6881&event=stopped HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let mut resp = Vec::new();
        stream.read_to_end(&mut resp).unwrap();

        assert!(registry.peers_excluding(info_hash, PeerId([0; 20])).0.is_empty());
        stop.store(true, Ordering::SeqCst);
    }

    #[test]
    fn scrape_with_no_info_hash_returns_empty_files() {
        let (addr, stop, _registry) = spawn_server();
        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET /scrape HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let mut resp = Vec::new();
        stream.read_to_end(&mut resp).unwrap();
        let body = split_body(&resp);
        let decoded: ScrapeResponse = serde_bencode::from_bytes(body).unwrap();
        assert!(decoded.files.is_empty());
        stop.store(true, Ordering::SeqCst);
    }

    fn split_body(resp: &[u8]) -> &[u8] {
        let pos = find_header_end(resp).unwrap();
        &resp[pos..]
    }
}
