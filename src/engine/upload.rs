//! Upload engine (§2 item 8, §4.7, §5): a connection acceptor with short
//! accept timeouts to observe the stop flag, and one session handler
//! thread per accepted connection, serving `Request`s straight out of
//! the `Assembler` and metadata sub-requests out of the raw `info`
//! bytes. Generalizes the accept-loop shape implied by
//! `jsondevers-bobby-bit/src/peer/connection.rs spawn_peer`'s per-socket
//! thread, which only ever handled the downloader side.

use crate::bitfield::Bitfield;
use crate::conf::Conf;
use crate::engine::assembler::Assembler;
use crate::error::{BtError, Result};
use crate::metainfo::{InfoHash, PeerId};
use crate::peer::metadata::respond_to_request;
use crate::wire::extension::{ExtendedHandshake, MetadataMessage, UT_METADATA_EXT_ID};
use crate::wire::{Handshake, Message};
use log::{debug, info, warn};
use std::io::{BufReader, BufWriter};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

pub struct UploadEngine {
    info_hash: InfoHash,
    my_id: PeerId,
    bitfield: Bitfield,
    piece_length: u64,
    num_pieces: usize,
    info_bytes: Arc<Vec<u8>>,
    assembler: Arc<Assembler>,
    conf: Conf,
}

impl UploadEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info_hash: InfoHash,
        my_id: PeerId,
        bitfield: Bitfield,
        piece_length: u64,
        num_pieces: usize,
        info_bytes: Vec<u8>,
        assembler: Arc<Assembler>,
        conf: Conf,
    ) -> Self {
        UploadEngine {
            info_hash,
            my_id,
            bitfield,
            piece_length,
            num_pieces,
            info_bytes: Arc::new(info_bytes),
            assembler,
            conf,
        }
    }

    /// Accepts connections until `stop` is set (§5 task kind 2), each on
    /// its own session handler thread (kind 3).
    pub fn serve(&self, listener: TcpListener, stop: Arc<AtomicBool>) -> std::io::Result<()> {
        listener.set_nonblocking(true)?;
        info!("seeding on {}", listener.local_addr()?);

        loop {
            if stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    let info_hash = self.info_hash;
                    let my_id = self.my_id;
                    let bitfield = self.bitfield.clone();
                    let piece_length = self.piece_length;
                    let num_pieces = self.num_pieces;
                    let info_bytes = Arc::clone(&self.info_bytes);
                    let assembler = Arc::clone(&self.assembler);
                    let conf = self.conf.clone();
                    thread::spawn(move || {
                        if let Err(e) = handle_session(stream, info_hash, my_id, &bitfield, piece_length, num_pieces, &info_bytes, &assembler, &conf) {
                            debug!("upload session with {peer_addr} ended: {e}");
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

/// Length of piece `index`, accounting for a shorter final piece, the
/// same arithmetic `Metainfo::piece_len` uses on the download side (§3
/// invariant: `last = total_length - (N-1)*piece_length`).
fn actual_piece_len(index: usize, num_pieces: usize, piece_length: u64, total_length: u64) -> u64 {
    if num_pieces > 0 && index + 1 == num_pieces {
        total_length - (num_pieces as u64 - 1) * piece_length
    } else {
        piece_length
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_session(
    stream: TcpStream,
    info_hash: InfoHash,
    my_id: PeerId,
    bitfield: &Bitfield,
    piece_length: u64,
    num_pieces: usize,
    info_bytes: &[u8],
    assembler: &Assembler,
    conf: &Conf,
) -> Result<()> {
    stream.set_read_timeout(Some(conf.handshake_timeout))?;
    stream.set_write_timeout(Some(conf.handshake_timeout))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    let remote_hs = Handshake::read_from(&mut reader)?;
    if remote_hs.info_hash != info_hash {
        return Err(BtError::protocol("info_hash mismatch on inbound handshake"));
    }
    Handshake::new(info_hash, my_id, true).write_to(&mut writer)?;

    Message::Bitfield(bitfield.as_bytes().to_vec()).write_to(&mut writer)?;
    use std::io::Write as _;
    writer.flush()?;

    reader.get_ref().set_read_timeout(Some(conf.message_timeout))?;
    let mut peer_interested = false;
    let mut peer_choked = true;

    loop {
        let msg = Message::read_from(&mut reader)?;
        match msg {
            Message::Interested => {
                peer_interested = true;
                peer_choked = false;
                Message::Unchoke.write_to(&mut writer)?;
                writer.flush()?;
            }
            Message::NotInterested => {
                peer_interested = false;
            }
            Message::Request { index, begin, length } => {
                if !peer_interested || peer_choked {
                    continue;
                }
                if !bitfield.has(index as usize) {
                    warn!("peer requested piece {index} we don't have");
                    continue;
                }
                let piece_len = actual_piece_len(index as usize, num_pieces, piece_length, assembler.total_length())
                    .min(u32::MAX as u64) as u32;
                if begin + length > piece_len {
                    warn!("peer requested out-of-range block index={index} begin={begin} length={length}");
                    continue;
                }
                let data = assembler.read_piece(index as usize, piece_len)?;
                let data = data[begin as usize..(begin + length) as usize].to_vec();
                Message::Piece { index, begin, data }.write_to(&mut writer)?;
                writer.flush()?;
            }
            Message::Extended { ext_id: 0, body } => {
                let remote_ext = ExtendedHandshake::from_bytes(&body)?;
                if remote_ext.supports_ut_metadata() {
                    let reply = ExtendedHandshake::new(Some(crate::wire::extension::chunk_count(info_bytes.len())));
                    Message::Extended { ext_id: 0, body: reply.to_bytes() }.write_to(&mut writer)?;
                    writer.flush()?;
                }
            }
            Message::Extended { ext_id, body } if ext_id == UT_METADATA_EXT_ID => {
                if let MetadataMessage::Request { piece } = MetadataMessage::from_body(&body)? {
                    respond_to_request(&mut writer, info_bytes, piece)?;
                    writer.flush()?;
                }
            }
            Message::Have(_) | Message::KeepAlive => {}
            Message::Choke | Message::Unchoke => {}
            other => debug!("ignoring unsupported inbound message {other:?}"),
        }
    }
}
