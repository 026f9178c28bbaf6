// Wire messages of the BitTorrent peer protocol (BEP 3). Extension protocol
// messages (ut_metadata, ut_pex, DHT port) are out of scope here: this crate
// only speaks the core exchange needed to request and deliver pieces.

use buffers::ByteBuf;
use clone_to_owned::CloneToOwned;

pub(crate) const INTEGER_LEN: usize = 4;
pub(crate) const MSGID_LEN: usize = 1;
pub(crate) const PREAMBLE_LEN: usize = INTEGER_LEN + MSGID_LEN;

pub(crate) type MsgId = u8;

pub(crate) const MSGID_CHOKE: MsgId = 0;
pub(crate) const MSGID_UNCHOKE: MsgId = 1;
pub(crate) const MSGID_INTERESTED: MsgId = 2;
pub(crate) const MSGID_NOT_INTERESTED: MsgId = 3;
pub(crate) const MSGID_HAVE: MsgId = 4;
pub(crate) const MSGID_BITFIELD: MsgId = 5;
pub(crate) const MSGID_REQUEST: MsgId = 6;
pub(crate) const MSGID_PIECE: MsgId = 7;
pub(crate) const MSGID_CANCEL: MsgId = 8;

/// Largest block payload this implementation will accept in a single PIECE
/// message.
pub const MAX_BLOCK_LEN: u32 = 1 << 17;
/// Largest whole message (length prefix value) this implementation will
/// accept, a PIECE message carrying the maximum block plus its 8-byte header.
pub const MAX_MSG_LEN: u32 = MAX_BLOCK_LEN + 9;

#[derive(Clone, Copy)]
pub struct MsgIdDebug(pub(crate) MsgId);

impl MsgIdDebug {
    const fn name(&self) -> Option<&'static str> {
        let n = match self.0 {
            MSGID_CHOKE => "choke",
            MSGID_UNCHOKE => "unchoke",
            MSGID_INTERESTED => "interested",
            MSGID_NOT_INTERESTED => "not_interested",
            MSGID_HAVE => "have",
            MSGID_BITFIELD => "bitfield",
            MSGID_REQUEST => "request",
            MSGID_PIECE => "piece",
            MSGID_CANCEL => "cancel",
            _ => return None,
        };
        Some(n)
    }
}

impl std::fmt::Debug for MsgIdDebug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "<unknown msg_id {}>", self.0),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MessageDeserializeError {
    #[error("not enough data (msgid={1:?}): expected at least {0} more bytes")]
    NotEnoughData(usize, Option<MsgIdDebug>),
    #[error("unsupported message id {0}")]
    UnsupportedMessageId(u8),
    #[error("incorrect message length msg_id={msg_id:?}, expected={expected}, received={received}")]
    IncorrectMsgLen {
        received: u32,
        expected: u32,
        msg_id: MsgIdDebug,
    },
    #[error("message length {0} exceeds the maximum accepted length {MAX_MSG_LEN}")]
    MessageTooLong(u32),
    #[error("pstr doesn't match the expected protocol string")]
    HandshakePstrWrongContent,
    #[error("pstr should be 19 bytes long but got {0}")]
    HandshakePstrWrongLength(u8),
}

#[derive(thiserror::Error, Debug)]
pub enum SerializeError {
    #[error("not enough space in buffer")]
    NoSpaceInBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    pub fn serialize_unchecked_len(&self, buf: &mut [u8]) -> usize {
        buf[0..4].copy_from_slice(&self.index.to_be_bytes());
        buf[4..8].copy_from_slice(&self.begin.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        12
    }
}

pub struct Piece<B> {
    pub index: u32,
    pub begin: u32,
    pub block: B,
}

impl<B: AsRef<[u8]>> std::fmt::Debug for Piece<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Piece")
            .field("index", &self.index)
            .field("begin", &self.begin)
            .field("len", &self.block.as_ref().len())
            .finish()
    }
}

impl CloneToOwned for Piece<ByteBuf<'_>> {
    type Target = Piece<buffers::ByteString>;

    fn clone_to_owned(&self) -> Self::Target {
        Piece {
            index: self.index,
            begin: self.begin,
            block: self.block.clone_to_owned(),
        }
    }
}

impl<B: AsRef<[u8]>> Piece<B> {
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.block.as_ref().len()
    }

    pub fn serialize_unchecked_len(&self, buf: &mut [u8]) -> usize {
        buf[0..4].copy_from_slice(&self.index.to_be_bytes());
        buf[4..8].copy_from_slice(&self.begin.to_be_bytes());
        let b = self.block.as_ref();
        buf[8..8 + b.len()].copy_from_slice(b);
        8 + b.len()
    }
}

#[derive(Debug)]
pub enum Message<'a> {
    Request(Request),
    Cancel(Request),
    Bitfield(ByteBuf<'a>),
    KeepAlive,
    Have(u32),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Piece(Piece<ByteBuf<'a>>),
}

impl Message<'_> {
    pub fn serialize(&self, out: &mut [u8]) -> Result<usize, SerializeError> {
        macro_rules! check_len {
            ($l:expr) => {
                if out.len() < $l {
                    return Err(SerializeError::NoSpaceInBuffer);
                }
            };
        }
        macro_rules! write_preamble {
            ($msg_len:expr, $msg_id:expr) => {
                out[0..4].copy_from_slice(&(($msg_len + 1u32).to_be_bytes()));
                out[4] = $msg_id;
            };
        }

        match self {
            Message::Request(request) | Message::Cancel(request) => {
                const TOTAL_LEN: usize = PREAMBLE_LEN + INTEGER_LEN * 3;
                check_len!(TOTAL_LEN);
                let msg_id = if matches!(self, Message::Request(..)) {
                    MSGID_REQUEST
                } else {
                    MSGID_CANCEL
                };
                write_preamble!((INTEGER_LEN * 3) as u32, msg_id);
                request.serialize_unchecked_len(&mut out[PREAMBLE_LEN..]);
                Ok(TOTAL_LEN)
            }
            Message::Bitfield(b) => {
                let block_len = b.as_ref().len();
                let total_len = PREAMBLE_LEN + block_len;
                check_len!(total_len);
                write_preamble!(block_len as u32, MSGID_BITFIELD);
                out[PREAMBLE_LEN..total_len].copy_from_slice(b.as_ref());
                Ok(total_len)
            }
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                check_len!(PREAMBLE_LEN);
                let msg_id = match self {
                    Message::Choke => MSGID_CHOKE,
                    Message::Unchoke => MSGID_UNCHOKE,
                    Message::Interested => MSGID_INTERESTED,
                    Message::NotInterested => MSGID_NOT_INTERESTED,
                    _ => unreachable!(),
                };
                write_preamble!(0, msg_id);
                Ok(PREAMBLE_LEN)
            }
            Message::Piece(p) => {
                let block_len = p.len();
                let payload_len = INTEGER_LEN * 2 + block_len;
                let total_len = PREAMBLE_LEN + payload_len;
                check_len!(total_len);
                write_preamble!(payload_len as u32, MSGID_PIECE);
                p.serialize_unchecked_len(&mut out[PREAMBLE_LEN..]);
                Ok(total_len)
            }
            Message::KeepAlive => {
                check_len!(4);
                out[0..4].copy_from_slice(&0u32.to_be_bytes());
                Ok(4)
            }
            Message::Have(v) => {
                check_len!(PREAMBLE_LEN + INTEGER_LEN);
                write_preamble!(INTEGER_LEN as u32, MSGID_HAVE);
                out[5..9].copy_from_slice(&v.to_be_bytes());
                Ok(9)
            }
        }
    }

    /// Parses a message out of a single contiguous buffer (used once the
    /// framer has assembled a whole message's bytes).
    pub fn deserialize(buf: &[u8]) -> Result<Message<'_>, MessageDeserializeError> {
        if buf.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let msg_id = buf[0];
        let body = &buf[1..];

        macro_rules! check_msg_len {
            ($expected:expr) => {{
                if body.len() != $expected {
                    return Err(MessageDeserializeError::IncorrectMsgLen {
                        received: body.len() as u32,
                        expected: $expected as u32,
                        msg_id: MsgIdDebug(msg_id),
                    });
                }
            }};
            (min $expected:expr) => {{
                if body.len() < $expected {
                    return Err(MessageDeserializeError::IncorrectMsgLen {
                        received: body.len() as u32,
                        expected: $expected as u32,
                        msg_id: MsgIdDebug(msg_id),
                    });
                }
            }};
        }

        match msg_id {
            MSGID_CHOKE => {
                check_msg_len!(0);
                Ok(Message::Choke)
            }
            MSGID_UNCHOKE => {
                check_msg_len!(0);
                Ok(Message::Unchoke)
            }
            MSGID_INTERESTED => {
                check_msg_len!(0);
                Ok(Message::Interested)
            }
            MSGID_NOT_INTERESTED => {
                check_msg_len!(0);
                Ok(Message::NotInterested)
            }
            MSGID_HAVE => {
                check_msg_len!(4);
                Ok(Message::Have(u32::from_be_bytes(body.try_into().unwrap())))
            }
            MSGID_BITFIELD => {
                check_msg_len!(min 1);
                Ok(Message::Bitfield(ByteBuf::from(body)))
            }
            MSGID_REQUEST | MSGID_CANCEL => {
                check_msg_len!(12);
                let request = Request {
                    index: u32::from_be_bytes(body[0..4].try_into().unwrap()),
                    begin: u32::from_be_bytes(body[4..8].try_into().unwrap()),
                    length: u32::from_be_bytes(body[8..12].try_into().unwrap()),
                };
                if msg_id == MSGID_REQUEST {
                    Ok(Message::Request(request))
                } else {
                    Ok(Message::Cancel(request))
                }
            }
            MSGID_PIECE => {
                check_msg_len!(min 8);
                let index = u32::from_be_bytes(body[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(body[4..8].try_into().unwrap());
                Ok(Message::Piece(Piece {
                    index,
                    begin,
                    block: ByteBuf::from(&body[8..]),
                }))
            }
            msg_id => Err(MessageDeserializeError::UnsupportedMessageId(msg_id)),
        }
    }
}
