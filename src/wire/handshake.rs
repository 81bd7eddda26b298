//! Fixed 68-byte handshake (§4.2): `pstrlen=19, "BitTorrent protocol",
//! 8 reserved bytes, info_hash, peer_id`. Generalizes
//! `jsondevers-bobby-bit/src/peer/handshake.rs`'s `Handshake` with the
//! extension-protocol capability bit, resolved per spec.md's explicit
//! instruction and `original_source/p2p/handshake.py` (`reserved[0] |=
//! 0x10`) rather than the alternate `reserved[5] & 0x20` reading spec.md
//! §9 also mentions (see DESIGN.md).

use crate::error::{BtError, Result};
use crate::metainfo::{InfoHash, PeerId};
use std::io::{Read, Write};

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
const EXTENSION_BIT: u8 = 0x10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId, supports_extensions: bool) -> Self {
        let mut reserved = [0u8; 8];
        if supports_extensions {
            reserved[0] |= EXTENSION_BIT;
        }
        Handshake {
            reserved,
            info_hash,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[0] & EXTENSION_BIT != 0
    }

    pub fn to_bytes(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(self.info_hash.as_bytes());
        buf[48..68].copy_from_slice(self.peer_id.as_bytes());
        buf
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        w.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Reads a fixed 68-byte handshake. Mismatched `pstrlen`/protocol
    /// string is a fatal protocol error (§4.2); the caller is responsible
    /// for comparing `info_hash` against the expected one, since only it
    /// knows whether a mismatch should be fatal (outbound) or just a
    /// reason to decline (inbound multi-torrent accept).
    pub fn read_from(r: &mut impl Read) -> Result<Self> {
        let mut buf = [0u8; 68];
        r.read_exact(&mut buf)?;

        let pstrlen = buf[0] as usize;
        if pstrlen != 19 {
            return Err(BtError::protocol(format!("unexpected pstrlen {pstrlen}")));
        }
        if &buf[1..20] != PROTOCOL {
            return Err(BtError::protocol("unexpected protocol string"));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let info_hash = InfoHash::from_bytes(&buf[28..48])?;
        let peer_id = PeerId::from_bytes(&buf[48..68])?;

        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips() {
        let hs = Handshake::new(InfoHash([1; 20]), PeerId([2; 20]), true);
        let bytes = hs.to_bytes();
        let mut cur = std::io::Cursor::new(bytes.to_vec());
        let decoded = Handshake::read_from(&mut cur).unwrap();
        assert_eq!(hs, decoded);
    }

    #[test]
    fn extension_bit_is_reserved_byte_zero() {
        let hs = Handshake::new(InfoHash([0; 20]), PeerId([0; 20]), true);
        assert_eq!(hs.reserved[0], 0x10);
        assert!(hs.supports_extensions());

        let hs = Handshake::new(InfoHash([0; 20]), PeerId([0; 20]), false);
        assert_eq!(hs.reserved, [0; 8]);
        assert!(!hs.supports_extensions());
    }

    #[test]
    fn rejects_bad_pstrlen() {
        let mut buf = Handshake::new(InfoHash([0; 20]), PeerId([0; 20]), false).to_bytes();
        buf[0] = 5;
        let mut cur = std::io::Cursor::new(buf.to_vec());
        assert!(Handshake::read_from(&mut cur).is_err());
    }
}
