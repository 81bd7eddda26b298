//! Announce-client used by the client controller (§4.9) to talk to a
//! tracker's HTTP surface. Adapted from
//! `jsondevers-bobby-bit/src/tracker/http.rs`'s `announce`/`scrape`,
//! replaced the `mio` poll loop with blocking `std::net::TcpStream` plus
//! read/write timeouts per §5, consistent with the rest of the crate.

use crate::conf::Conf;
use crate::error::{BtError, Result};
use crate::metainfo::{InfoHash, PeerId};
use crate::tracker::wire::{AnnounceResponse, ScrapeResponse};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use url::Url;
use urlencoding::encode_binary;

pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
    None,
}

impl AnnounceEvent {
    fn as_query_value(&self) -> Option<&'static str> {
        match self {
            AnnounceEvent::Started => Some("started"),
            AnnounceEvent::Stopped => Some("stopped"),
            AnnounceEvent::Completed => Some("completed"),
            AnnounceEvent::None => None,
        }
    }
}

pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

pub fn announce(tracker_url: &str, params: &AnnounceParams, conf: &Conf) -> Result<AnnounceResponse> {
    let url = Url::parse(tracker_url).map_err(|e| BtError::config(format!("invalid tracker url: {e}")))?;

    let mut query = format!(
        "?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        encode_binary(params.info_hash.as_bytes()),
        encode_binary(params.peer_id.as_bytes()),
        params.port,
        params.uploaded,
        params.downloaded,
        params.left,
    );
    if let Some(event) = params.event.as_query_value() {
        query.push_str("&event=");
        query.push_str(event);
    }

    let body = request(&url, &query, conf)?;
    let response: AnnounceResponse = serde_bencode::from_bytes(&body)
        .map_err(|e| BtError::tracker(format!("malformed announce response: {e}")))?;
    if let Some(reason) = &response.failure_reason {
        return Err(BtError::tracker(reason.clone()));
    }
    Ok(response)
}

pub fn scrape(tracker_url: &str, info_hash: InfoHash, conf: &Conf) -> Result<ScrapeResponse> {
    let mut url = Url::parse(tracker_url).map_err(|e| BtError::config(format!("invalid tracker url: {e}")))?;
    let path = url.path().replace("/announce", "/scrape");
    url.set_path(&path);

    let query = format!("?info_hash={}", encode_binary(info_hash.as_bytes()));
    let body = request(&url, &query, conf)?;
    serde_bencode::from_bytes(&body).map_err(|e| BtError::tracker(format!("malformed scrape response: {e}")))
}

fn request(url: &Url, query: &str, conf: &Conf) -> Result<Vec<u8>> {
    let host = url.host_str().ok_or_else(|| BtError::config("tracker url has no host"))?;
    let port = url.port().unwrap_or(80);
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(BtError::Transport)?
        .next()
        .ok_or_else(|| BtError::config("tracker host did not resolve"))?;

    let mut stream = TcpStream::connect_timeout(&addr, conf.connect_timeout)?;
    stream.set_read_timeout(Some(conf.tracker_ping_timeout))?;
    stream.set_write_timeout(Some(conf.tracker_ping_timeout))?;

    let request = format!(
        "GET {}{} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        url.path(),
        query,
        host
    );
    stream.write_all(request.as_bytes())?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;

    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
        .ok_or_else(|| BtError::tracker("malformed HTTP response from tracker"))?;
    Ok(raw[header_end..].to_vec())
}
