use torrent_core::id20::Id20;

use crate::messages::MessageDeserializeError;

const PSTR_BT1: &str = "BitTorrent protocol";

#[derive(Debug, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: u64,
    pub info_hash: Id20,
    pub peer_id: Id20,
}

impl Handshake {
    pub const LEN: usize = 1 + PSTR_BT1.len() + 8 + 20 + 20;

    pub fn new(info_hash: Id20, peer_id: Id20) -> Handshake {
        Handshake {
            reserved: 0,
            info_hash,
            peer_id,
        }
    }

    pub fn deserialize(b: &[u8]) -> Result<(Handshake, usize), MessageDeserializeError> {
        if b.len() < Self::LEN {
            return Err(MessageDeserializeError::NotEnoughData(
                Self::LEN - b.len(),
                None,
            ));
        }
        if b[0] as usize != PSTR_BT1.len() {
            return Err(MessageDeserializeError::HandshakePstrWrongLength(b[0]));
        }
        if &b[1..20] != PSTR_BT1.as_bytes() {
            return Err(MessageDeserializeError::HandshakePstrWrongContent);
        }

        let h = Handshake {
            reserved: u64::from_be_bytes(b[20..28].try_into().unwrap()),
            info_hash: Id20(b[28..48].try_into().unwrap()),
            peer_id: Id20(b[48..68].try_into().unwrap()),
        };
        Ok((h, Self::LEN))
    }

    #[must_use]
    pub fn serialize_unchecked_len(&self, buf: &mut [u8]) -> usize {
        buf[0] = 19;
        buf[1..20].copy_from_slice(PSTR_BT1.as_bytes());
        buf[20..28].copy_from_slice(&self.reserved.to_be_bytes());
        buf[28..48].copy_from_slice(&self.info_hash.0);
        buf[48..68].copy_from_slice(&self.peer_id.0);
        Self::LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_roundtrip() {
        let info_hash = Id20([1u8; 20]);
        let peer_id = Id20([2u8; 20]);
        let mut buf = [0u8; 100];
        let se = Handshake::new(info_hash, peer_id);
        let len = se.serialize_unchecked_len(&mut buf);
        assert_eq!(len, Handshake::LEN);

        let (de, dlen) = Handshake::deserialize(&buf).unwrap();
        assert_eq!(dlen, len);
        assert_eq!(se, de);
    }

    #[test]
    fn test_handshake_bad_pstr() {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1] = b'X';
        assert!(matches!(
            Handshake::deserialize(&buf),
            Err(MessageDeserializeError::HandshakePstrWrongContent)
        ));
    }
}
