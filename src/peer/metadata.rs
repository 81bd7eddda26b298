//! Fetches a torrent's `info` dictionary over the wire from a peer that
//! supports `ut_metadata`, for magnet-link downloads (§4.6). Grounded on
//! `original_source/p2p/peer_communication.py`'s metadata exchange
//! (`send_metadata_request`/`handle_metadata_message`), reshaped onto the
//! same blocking `TcpStream` primitives as `peer::session::PeerSession`.

use crate::conf::Conf;
use crate::error::{BtError, Result};
use crate::metainfo::{InfoHash, Metainfo, PeerId};
use crate::wire::extension::{self, ExtendedHandshake, MetadataMessage, UT_METADATA_EXT_ID};
use crate::wire::{Handshake, Message};
use std::io::{BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpStream};

/// Connects to a peer, performs the regular handshake followed by the
/// extended handshake, and pulls every metadata chunk in order until the
/// full `info` dictionary is assembled and verified against `info_hash`.
/// Returns `Protocol`/`Config` errors (peer doesn't support the
/// extension, rejects every chunk, or the assembled bytes don't hash to
/// `info_hash`) that callers treat as "try the next peer" (§4.6/§4.9).
pub fn fetch_metainfo(
    addr: SocketAddr,
    info_hash: InfoHash,
    my_id: PeerId,
    conf: &Conf,
) -> Result<Metainfo> {
    let stream = TcpStream::connect_timeout(&addr, conf.connect_timeout)?;
    stream.set_read_timeout(Some(conf.handshake_timeout))?;
    stream.set_write_timeout(Some(conf.handshake_timeout))?;

    let mut writer = BufWriter::new(stream.try_clone()?);
    let mut reader = BufReader::new(stream);

    Handshake::new(info_hash, my_id, true).write_to(&mut writer)?;
    writer.flush()?;

    let remote_hs = Handshake::read_from(&mut reader)?;
    if remote_hs.info_hash != info_hash {
        return Err(BtError::protocol("info_hash mismatch on handshake"));
    }
    if !remote_hs.supports_extensions() {
        return Err(BtError::protocol("peer does not advertise extension support"));
    }

    Message::Extended {
        ext_id: 0,
        body: ExtendedHandshake::new(None).to_bytes(),
    }
    .write_to(&mut writer)?;
    writer.flush()?;

    reader.get_ref().set_read_timeout(Some(conf.message_timeout))?;
    let remote_ext = loop {
        match Message::read_from(&mut reader)? {
            Message::Extended { ext_id: 0, body } => break ExtendedHandshake::from_bytes(&body)?,
            Message::Extended { .. } | Message::KeepAlive | Message::Have(_) => continue,
            other => {
                return Err(BtError::protocol(format!(
                    "expected extended handshake, got {other:?}"
                )))
            }
        }
    };
    if !remote_ext.supports_ut_metadata() {
        return Err(BtError::protocol("peer does not support ut_metadata"));
    }

    let total_pieces = remote_ext
        .pieces_number
        .ok_or_else(|| BtError::protocol("extended handshake missing pieces_number"))?
        as usize;

    let mut chunks: Vec<Option<Vec<u8>>> = vec![None; total_pieces];
    for piece in 0..total_pieces {
        Message::Extended {
            ext_id: UT_METADATA_EXT_ID,
            body: MetadataMessage::Request { piece: piece as u32 }.to_body(),
        }
        .write_to(&mut writer)?;
        writer.flush()?;

        let reply = loop {
            match Message::read_from(&mut reader)? {
                Message::Extended { ext_id, body } if ext_id == UT_METADATA_EXT_ID => {
                    break MetadataMessage::from_body(&body)?
                }
                Message::Extended { .. } | Message::KeepAlive | Message::Have(_) => continue,
                other => {
                    return Err(BtError::protocol(format!(
                        "expected metadata reply, got {other:?}"
                    )))
                }
            }
        };

        match reply {
            MetadataMessage::Data { piece: got, data } if got as usize == piece => {
                chunks[piece] = Some(data);
            }
            MetadataMessage::Reject { .. } => {
                return Err(BtError::protocol("peer rejected metadata request"));
            }
            other => {
                return Err(BtError::protocol(format!(
                    "unexpected metadata reply for piece {piece}: {other:?}"
                )))
            }
        }
    }

    let info_bytes: Vec<u8> = chunks
        .into_iter()
        .enumerate()
        .map(|(i, c)| c.ok_or_else(|| BtError::protocol(format!("never received metadata piece {i}"))))
        .collect::<Result<Vec<_>>>()?
        .concat();

    let metainfo = Metainfo::from_info_bytes(&info_bytes, info_hash, None)?;

    Message::Extended {
        ext_id: UT_METADATA_EXT_ID,
        body: MetadataMessage::Ack {
            pieces_number: total_pieces as u32,
        }
        .to_body(),
    }
    .write_to(&mut writer)?;
    writer.flush()?;

    Ok(metainfo)
}

/// Answers one metadata request from a peer connected to the upload
/// engine (§4.7): replies with the requested chunk or `Reject` if the
/// index is out of range. Used by `engine::upload` once it has
/// recognized an `Extended(ext_id=ut_metadata)` request on an
/// already-established session.
pub fn respond_to_request(
    writer: &mut impl Write,
    info_bytes: &[u8],
    piece: u32,
) -> Result<()> {
    let reply = match extension::chunk(info_bytes, piece as usize) {
        Some(data) => MetadataMessage::Data {
            piece,
            data: data.to_vec(),
        },
        None => MetadataMessage::Reject { piece },
    };
    Message::Extended {
        ext_id: UT_METADATA_EXT_ID,
        body: reply.to_body(),
    }
    .write_to(writer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::extension::chunk_count;
    use std::io::BufReader as StdBufReader;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn fetches_metainfo_over_extended_handshake() {
        let info = crate::metainfo::Info {
            name: "magnet-file.bin".into(),
            pieces: serde_bytes::ByteBuf::from(vec![0u8; 20]),
            piece_length: 16384,
            length: Some(16384),
            files: None,
            private: None,
        };
        let metainfo = Metainfo {
            info,
            announce: None,
            announce_list: None,
        };
        let info_bytes = metainfo.info_bytes();
        let info_hash = metainfo.info_hash();
        let n_chunks = chunk_count(info_bytes.len()).max(1);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let info_bytes_clone = info_bytes.clone();
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = StdBufReader::new(stream.try_clone().unwrap());
            let mut writer = BufWriter::new(stream);

            let client_hs = Handshake::read_from(&mut reader).unwrap();
            Handshake::new(client_hs.info_hash, PeerId([7; 20]), true)
                .write_to(&mut writer)
                .unwrap();
            writer.flush().unwrap();

            let hs_msg = Message::read_from(&mut reader).unwrap();
            assert!(matches!(hs_msg, Message::Extended { ext_id: 0, .. }));
            Message::Extended {
                ext_id: 0,
                body: ExtendedHandshake::new(Some(n_chunks)).to_bytes(),
            }
            .write_to(&mut writer)
            .unwrap();
            writer.flush().unwrap();

            for _ in 0..n_chunks {
                match Message::read_from(&mut reader).unwrap() {
                    Message::Extended { ext_id, body } if ext_id == UT_METADATA_EXT_ID => {
                        let req = MetadataMessage::from_body(&body).unwrap();
                        if let MetadataMessage::Request { piece } = req {
                            let data = extension::chunk(&info_bytes_clone, piece as usize)
                                .unwrap()
                                .to_vec();
                            Message::Extended {
                                ext_id: UT_METADATA_EXT_ID,
                                body: MetadataMessage::Data { piece, data }.to_body(),
                            }
                            .write_to(&mut writer)
                            .unwrap();
                            writer.flush().unwrap();
                        }
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }

            let ack = Message::read_from(&mut reader).unwrap();
            assert!(matches!(ack, Message::Extended { ext_id, .. } if ext_id == UT_METADATA_EXT_ID));
        });

        let conf = Conf::default();
        let fetched = fetch_metainfo(addr, info_hash, PeerId([1; 20]), &conf).unwrap();
        assert_eq!(fetched.info_hash(), info_hash);
        assert_eq!(fetched.name(), "magnet-file.bin");
    }
}
