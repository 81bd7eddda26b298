//! Extension sub-protocol for metainfo transfer (§4.6): the extended
//! handshake (`Extended(ext_id=0)`) and the four `ut_metadata`
//! sub-messages carried by `Extended(ext_id=1)`. Encoding follows
//! `original_source/p2p/message.py` (`format_metadata_request/_data/
//! _reject`, each a bencoded mapping, `msg_type=1` followed by raw
//! trailing bytes rather than itself bencoded).

use crate::conf::METADATA_CHUNK_SIZE;
use crate::error::{BtError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const UT_METADATA_EXT_ID: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtendedHandshake {
    pub m: BTreeMap<String, i64>,
    pub pieces_number: Option<i64>,
}

impl ExtendedHandshake {
    pub fn new(pieces_number: Option<usize>) -> Self {
        let mut m = BTreeMap::new();
        m.insert("ut_metadata".to_string(), UT_METADATA_EXT_ID as i64);
        ExtendedHandshake {
            m,
            pieces_number: pieces_number.map(|n| n as i64),
        }
    }

    pub fn supports_ut_metadata(&self) -> bool {
        self.m.contains_key("ut_metadata")
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_bencode::to_bytes(self).expect("ExtendedHandshake serializes infallibly")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_bencode::from_bytes(bytes)
            .map_err(|e| BtError::protocol(format!("malformed extended handshake: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, data: Vec<u8> },
    Reject { piece: u32 },
    /// Peer acknowledges it received a full `pieces_number`-piece
    /// metadata set; the session may terminate (§4.6).
    Ack { pieces_number: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
struct Wire {
    msg_type: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    piece: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    total_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pieces_number: Option<i64>,
}

impl MetadataMessage {
    /// Encodes the `Extended(ext_id=1)` body: a bencoded mapping, with
    /// `Data`'s raw chunk bytes appended after it (§4.6).
    pub fn to_body(&self) -> Vec<u8> {
        let (wire, trailing): (Wire, &[u8]) = match self {
            MetadataMessage::Request { piece } => (
                Wire { msg_type: 0, piece: Some(*piece as i64), total_size: None, pieces_number: None },
                &[],
            ),
            MetadataMessage::Data { piece, data } => (
                Wire {
                    msg_type: 1,
                    piece: Some(*piece as i64),
                    total_size: Some(data.len() as i64),
                    pieces_number: None,
                },
                data,
            ),
            MetadataMessage::Reject { piece } => (
                Wire { msg_type: 2, piece: Some(*piece as i64), total_size: None, pieces_number: None },
                &[],
            ),
            MetadataMessage::Ack { pieces_number } => (
                Wire { msg_type: 3, piece: None, total_size: None, pieces_number: Some(*pieces_number as i64) },
                &[],
            ),
        };
        let mut body = serde_bencode::to_bytes(&wire).expect("Wire serializes infallibly");
        body.extend_from_slice(trailing);
        body
    }

    /// Decodes an `Extended(ext_id=1)` body. `Data`'s trailing bytes are
    /// located using a manual bencode-length scan, since
    /// `serde_bencode::from_bytes` requires consuming the whole input and
    /// can't stop at the end of the dict to hand back the remainder.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let dict_len = bencode_value_len(body)?;
        let wire: Wire = serde_bencode::from_bytes(&body[..dict_len])
            .map_err(|e| BtError::protocol(format!("malformed metadata message: {e}")))?;
        let rest = &body[dict_len..];

        match wire.msg_type {
            0 => Ok(MetadataMessage::Request {
                piece: require(wire.piece, "piece")? as u32,
            }),
            1 => {
                let piece = require(wire.piece, "piece")? as u32;
                let total_size = require(wire.total_size, "total_size")? as usize;
                if rest.len() != total_size {
                    return Err(BtError::protocol(format!(
                        "metadata data declared {total_size} bytes, got {}",
                        rest.len()
                    )));
                }
                Ok(MetadataMessage::Data { piece, data: rest.to_vec() })
            }
            2 => Ok(MetadataMessage::Reject {
                piece: require(wire.piece, "piece")? as u32,
            }),
            3 => Ok(MetadataMessage::Ack {
                pieces_number: require(wire.pieces_number, "pieces_number")? as u32,
            }),
            other => Err(BtError::protocol(format!("unknown metadata msg_type {other}"))),
        }
    }
}

fn require(v: Option<i64>, field: &str) -> Result<i64> {
    v.ok_or_else(|| BtError::protocol(format!("missing required field {field}")))
}

/// Number of 16KiB chunks needed to carry `info_bytes`, for the
/// `pieces_number` advertised in the extended handshake.
pub fn chunk_count(info_len: usize) -> usize {
    (info_len + METADATA_CHUNK_SIZE - 1) / METADATA_CHUNK_SIZE
}

pub fn chunk(info_bytes: &[u8], index: usize) -> Option<&[u8]> {
    let start = index * METADATA_CHUNK_SIZE;
    if start >= info_bytes.len() {
        return None;
    }
    let end = (start + METADATA_CHUNK_SIZE).min(info_bytes.len());
    Some(&info_bytes[start..end])
}

/// Length in bytes of the single bencoded value starting at `buf[0]`.
fn bencode_value_len(buf: &[u8]) -> Result<usize> {
    fn find(buf: &[u8], from: usize, needle: u8) -> Result<usize> {
        buf[from..]
            .iter()
            .position(|&b| b == needle)
            .map(|p| p + from)
            .ok_or_else(|| BtError::protocol("truncated bencode value"))
    }

    fn scan(buf: &[u8], pos: usize) -> Result<usize> {
        match buf.get(pos) {
            Some(b'i') => Ok(find(buf, pos + 1, b'e')? + 1),
            Some(b'l') => {
                let mut p = pos + 1;
                while buf.get(p) != Some(&b'e') {
                    p = scan(buf, p)?;
                }
                Ok(p + 1)
            }
            Some(b'd') => {
                let mut p = pos + 1;
                while buf.get(p) != Some(&b'e') {
                    p = scan(buf, p)?; // key
                    p = scan(buf, p)?; // value
                }
                Ok(p + 1)
            }
            Some(c) if c.is_ascii_digit() => {
                let colon = find(buf, pos, b':')?;
                let len: usize = std::str::from_utf8(&buf[pos..colon])
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| BtError::protocol("invalid bencode string length"))?;
                Ok(colon + 1 + len)
            }
            _ => Err(BtError::protocol("invalid bencode value")),
        }
    }

    scan(buf, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_handshake_roundtrips() {
        let hs = ExtendedHandshake::new(Some(3));
        let bytes = hs.to_bytes();
        let decoded = ExtendedHandshake::from_bytes(&bytes).unwrap();
        assert!(decoded.supports_ut_metadata());
        assert_eq!(decoded.pieces_number, Some(3));
    }

    #[test]
    fn metadata_request_roundtrips() {
        let msg = MetadataMessage::Request { piece: 2 };
        let body = msg.to_body();
        assert_eq!(MetadataMessage::from_body(&body).unwrap(), msg);
    }

    #[test]
    fn metadata_data_roundtrips_with_trailing_bytes() {
        let msg = MetadataMessage::Data { piece: 0, data: vec![1, 2, 3, 4, 5] };
        let body = msg.to_body();
        assert_eq!(MetadataMessage::from_body(&body).unwrap(), msg);
    }

    #[test]
    fn metadata_data_rejects_wrong_total_size() {
        let msg = MetadataMessage::Data { piece: 0, data: vec![1, 2, 3] };
        let mut body = msg.to_body();
        body.push(0xff); // one stray trailing byte beyond declared total_size
        assert!(MetadataMessage::from_body(&body).is_err());
    }

    #[test]
    fn ack_roundtrips() {
        let msg = MetadataMessage::Ack { pieces_number: 7 };
        let body = msg.to_body();
        assert_eq!(MetadataMessage::from_body(&body).unwrap(), msg);
    }

    #[test]
    fn chunking_matches_size() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(METADATA_CHUNK_SIZE), 1);
        assert_eq!(chunk_count(METADATA_CHUNK_SIZE + 1), 2);

        let data = vec![7u8; METADATA_CHUNK_SIZE + 10];
        assert_eq!(chunk(&data, 0).unwrap().len(), METADATA_CHUNK_SIZE);
        assert_eq!(chunk(&data, 1).unwrap().len(), 10);
        assert!(chunk(&data, 2).is_none());
    }
}
