// Incremental message framer: turns a byte stream into discrete peer
// protocol frames without requiring the whole message to be available in one
// contiguous read. Modeled as an explicit state machine so that a stalled or
// slow-trickling peer never forces a message to be buffered beyond its own
// declared length, and so a piece payload we don't want (no outstanding
// request for it any more) can be skipped without allocating for it.

use buffers::ByteString;

use crate::messages::{
    MessageDeserializeError, Request, MAX_MSG_LEN, MSGID_BITFIELD, MSGID_CANCEL, MSGID_CHOKE,
    MSGID_HAVE, MSGID_INTERESTED, MSGID_NOT_INTERESTED, MSGID_PIECE, MSGID_REQUEST,
    MSGID_UNCHOKE,
};

/// A fully decoded, owned protocol frame.
#[derive(Debug)]
pub enum Frame {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(ByteString),
    Request(Request),
    Cancel(Request),
    Piece {
        index: u32,
        begin: u32,
        block: ByteString,
    },
}

/// Whether the caller wants the upcoming piece payload buffered, or
/// discarded byte-for-byte as it arrives (e.g. because the corresponding
/// request was cancelled, or the piece index/offset doesn't match anything
/// we asked for).
pub enum PieceDisposition {
    Accept,
    Skip,
}

enum State {
    Idle,
    Length { buf: [u8; 4], filled: u8 },
    Type { msg_len: u32 },
    Msg {
        msg_id: u8,
        need: usize,
        buf: [u8; 12],
        filled: usize,
    },
    Bitfield {
        buf: Vec<u8>,
        filled: usize,
    },
    PieceHeader {
        remaining: u32,
        buf: [u8; 8],
        filled: usize,
    },
    Piece {
        index: u32,
        begin: u32,
        buf: Vec<u8>,
        filled: usize,
    },
    SkipPiece {
        remaining: usize,
    },
}

/// Incremental reader side of the wire protocol: `Idle -> Length -> Type ->
/// {Msg | Bitfield | Piece | SkipPiece} -> Idle`.
pub struct ProtocolReader {
    state: State,
}

impl Default for ProtocolReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolReader {
    pub fn new() -> Self {
        Self { state: State::Idle }
    }

    /// Feeds as much of `input` as is needed to make progress, advancing
    /// `input` past the consumed bytes. Returns `Ok(Some(frame))` once a
    /// whole frame has been assembled, `Ok(None)` if `input` ran out first.
    ///
    /// `piece_disposition` is consulted exactly once per piece message, right
    /// after its 8-byte header (index, begin) has been parsed, to decide
    /// whether to buffer or skip the payload.
    pub fn poll(
        &mut self,
        input: &mut &[u8],
        piece_disposition: impl FnOnce(u32, u32) -> PieceDisposition,
    ) -> Result<Option<Frame>, MessageDeserializeError> {
        let mut piece_disposition = Some(piece_disposition);
        loop {
            match &mut self.state {
                State::Idle => {
                    self.state = State::Length {
                        buf: [0; 4],
                        filled: 0,
                    };
                }
                State::Length { buf, filled } => {
                    if !fill(buf, filled, input) {
                        return Ok(None);
                    }
                    let msg_len = u32::from_be_bytes(*buf);
                    if msg_len == 0 {
                        self.state = State::Idle;
                        return Ok(Some(Frame::KeepAlive));
                    }
                    if msg_len > MAX_MSG_LEN {
                        return Err(MessageDeserializeError::MessageTooLong(msg_len));
                    }
                    self.state = State::Type { msg_len };
                }
                State::Type { msg_len } => {
                    let Some((&msg_id, rest)) = input.split_first() else {
                        return Ok(None);
                    };
                    *input = rest;
                    let remaining = *msg_len - 1;
                    self.state = dispatch(msg_id, remaining)?;
                }
                State::Msg {
                    msg_id,
                    need,
                    buf,
                    filled,
                } => {
                    if !fill(&mut buf[..*need], filled, input) {
                        return Ok(None);
                    }
                    let frame = finish_fixed(*msg_id, &buf[..*need])?;
                    self.state = State::Idle;
                    return Ok(Some(frame));
                }
                State::Bitfield { buf, filled } => {
                    if !fill(buf.as_mut_slice(), filled, input) {
                        return Ok(None);
                    }
                    let bytes = std::mem::take(buf);
                    self.state = State::Idle;
                    return Ok(Some(Frame::Bitfield(bytes.into())));
                }
                State::PieceHeader {
                    remaining,
                    buf,
                    filled,
                } => {
                    if !fill(buf, filled, input) {
                        return Ok(None);
                    }
                    let index = u32::from_be_bytes(buf[0..4].try_into().unwrap());
                    let begin = u32::from_be_bytes(buf[4..8].try_into().unwrap());
                    let payload_len = *remaining as usize - 8;
                    let disposition = piece_disposition
                        .take()
                        .map(|f| f(index, begin))
                        .unwrap_or(PieceDisposition::Accept);
                    self.state = match disposition {
                        PieceDisposition::Accept => State::Piece {
                            index,
                            begin,
                            buf: vec![0u8; payload_len],
                            filled: 0,
                        },
                        PieceDisposition::Skip => State::SkipPiece {
                            remaining: payload_len,
                        },
                    };
                }
                State::Piece {
                    index,
                    begin,
                    buf,
                    filled,
                } => {
                    if !fill(buf.as_mut_slice(), filled, input) {
                        return Ok(None);
                    }
                    let index = *index;
                    let begin = *begin;
                    let bytes = std::mem::take(buf);
                    self.state = State::Idle;
                    return Ok(Some(Frame::Piece {
                        index,
                        begin,
                        block: bytes.into(),
                    }));
                }
                State::SkipPiece { remaining } => {
                    let n = (*remaining).min(input.len());
                    *input = &input[n..];
                    *remaining -= n;
                    if *remaining > 0 {
                        return Ok(None);
                    }
                    self.state = State::Idle;
                }
            }
        }
    }
}

fn dispatch(msg_id: u8, remaining: u32) -> Result<State, MessageDeserializeError> {
    use crate::messages::MsgIdDebug;

    let fixed_len = |want: usize| -> Result<usize, MessageDeserializeError> {
        if remaining as usize != want {
            return Err(MessageDeserializeError::IncorrectMsgLen {
                received: remaining,
                expected: want as u32,
                msg_id: MsgIdDebug(msg_id),
            });
        }
        Ok(want)
    };

    Ok(match msg_id {
        MSGID_CHOKE | MSGID_UNCHOKE | MSGID_INTERESTED | MSGID_NOT_INTERESTED => {
            fixed_len(0)?;
            State::Msg {
                msg_id,
                need: 0,
                buf: [0; 12],
                filled: 0,
            }
        }
        MSGID_HAVE => {
            let need = fixed_len(4)?;
            State::Msg {
                msg_id,
                need,
                buf: [0; 12],
                filled: 0,
            }
        }
        MSGID_REQUEST | MSGID_CANCEL => {
            let need = fixed_len(12)?;
            State::Msg {
                msg_id,
                need,
                buf: [0; 12],
                filled: 0,
            }
        }
        MSGID_BITFIELD => {
            if remaining == 0 {
                return Err(MessageDeserializeError::IncorrectMsgLen {
                    received: 0,
                    expected: 1,
                    msg_id: MsgIdDebug(msg_id),
                });
            }
            State::Bitfield {
                buf: vec![0u8; remaining as usize],
                filled: 0,
            }
        }
        MSGID_PIECE => {
            if remaining < 8 {
                return Err(MessageDeserializeError::IncorrectMsgLen {
                    received: remaining,
                    expected: 8,
                    msg_id: MsgIdDebug(msg_id),
                });
            }
            State::PieceHeader {
                remaining,
                buf: [0; 8],
                filled: 0,
            }
        }
        other => return Err(MessageDeserializeError::UnsupportedMessageId(other)),
    })
}

fn finish_fixed(msg_id: u8, body: &[u8]) -> Result<Frame, MessageDeserializeError> {
    Ok(match msg_id {
        MSGID_CHOKE => Frame::Choke,
        MSGID_UNCHOKE => Frame::Unchoke,
        MSGID_INTERESTED => Frame::Interested,
        MSGID_NOT_INTERESTED => Frame::NotInterested,
        MSGID_HAVE => Frame::Have(u32::from_be_bytes(body.try_into().unwrap())),
        MSGID_REQUEST | MSGID_CANCEL => {
            let request = Request {
                index: u32::from_be_bytes(body[0..4].try_into().unwrap()),
                begin: u32::from_be_bytes(body[4..8].try_into().unwrap()),
                length: u32::from_be_bytes(body[8..12].try_into().unwrap()),
            };
            if msg_id == MSGID_REQUEST {
                Frame::Request(request)
            } else {
                Frame::Cancel(request)
            }
        }
        _ => unreachable!("dispatch() only routes fixed-size ids here"),
    })
}

/// Copies as much of `input` into `buf[*filled..]` as available, advancing
/// both. Returns `true` once `buf` is completely filled.
fn fill(buf: &mut [u8], filled: &mut usize, input: &mut &[u8]) -> bool {
    let need = buf.len() - *filled;
    let take = need.min(input.len());
    buf[*filled..*filled + take].copy_from_slice(&input[..take]);
    *filled += take;
    *input = &input[take..];
    *filled == buf.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(reader: &mut ProtocolReader, mut data: &[u8]) -> Vec<Frame> {
        let mut out = Vec::new();
        loop {
            match reader.poll(&mut data, |_, _| PieceDisposition::Accept) {
                Ok(Some(f)) => out.push(f),
                Ok(None) => break,
                Err(e) => panic!("{e}"),
            }
        }
        out
    }

    #[test]
    fn test_keepalive() {
        let mut r = ProtocolReader::new();
        let frames = feed_all(&mut r, &[0, 0, 0, 0]);
        assert!(matches!(frames.as_slice(), [Frame::KeepAlive]));
    }

    #[test]
    fn test_choke_byte_by_byte() {
        let mut r = ProtocolReader::new();
        let msg = [0, 0, 0, 1, 0]; // len=1, msgid=choke
        let mut got = None;
        for b in msg {
            let one = [b];
            let mut s: &[u8] = &one;
            if let Some(f) = r.poll(&mut s, |_, _| PieceDisposition::Accept).unwrap() {
                got = Some(f);
            }
        }
        assert!(matches!(got, Some(Frame::Choke)));
    }

    #[test]
    fn test_have() {
        let mut r = ProtocolReader::new();
        let mut msg = vec![0, 0, 0, 5, 4];
        msg.extend_from_slice(&42u32.to_be_bytes());
        let frames = feed_all(&mut r, &msg);
        assert!(matches!(frames.as_slice(), [Frame::Have(42)]));
    }

    #[test]
    fn test_bitfield() {
        let mut r = ProtocolReader::new();
        let mut msg = vec![0, 0, 0, 4, 5];
        msg.extend_from_slice(&[0b1010_1010; 3]);
        let frames = feed_all(&mut r, &msg);
        match &frames[..] {
            [Frame::Bitfield(bf)] => assert_eq!(bf.as_ref(), &[0b1010_1010; 3]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_piece_accept() {
        let mut r = ProtocolReader::new();
        let mut msg = vec![0, 0, 0, 0, 7]; // placeholder length, fixed below
        msg.extend_from_slice(&7u32.to_be_bytes()); // index
        msg.extend_from_slice(&0u32.to_be_bytes()); // begin
        msg.extend_from_slice(b"hello");
        let payload_len = (4 + 4 + 5) as u32;
        msg[0..4].copy_from_slice(&(payload_len + 1).to_be_bytes());
        let frames = feed_all(&mut r, &msg);
        match &frames[..] {
            [Frame::Piece { index, begin, block }] => {
                assert_eq!(*index, 7);
                assert_eq!(*begin, 0);
                assert_eq!(block.as_ref(), b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_piece_skip() {
        // A skipped piece never produces a `Frame::Piece` at all: the
        // payload bytes are discarded as they arrive and the reader goes
        // straight back to `Idle`. Append a keepalive after it and check
        // that's the only frame the caller ever sees.
        let mut r = ProtocolReader::new();
        let mut msg = vec![0u8; 5];
        msg.extend_from_slice(&7u32.to_be_bytes());
        msg.extend_from_slice(&0u32.to_be_bytes());
        msg.extend_from_slice(b"hello");
        let payload_len = (4 + 4 + 5) as u32;
        msg[0..4].copy_from_slice(&(payload_len + 1).to_be_bytes());
        msg[4] = MSGID_PIECE;
        msg.extend_from_slice(&[0, 0, 0, 0]); // trailing keepalive

        let mut data: &[u8] = &msg;
        let mut first_disposition = Some(PieceDisposition::Skip);
        let mut frames = Vec::new();
        loop {
            match r
                .poll(&mut data, |_, _| {
                    first_disposition.take().unwrap_or(PieceDisposition::Accept)
                })
                .unwrap()
            {
                Some(f) => frames.push(f),
                None if data.is_empty() => break,
                None => continue,
            }
        }
        assert!(matches!(frames.as_slice(), [Frame::KeepAlive]));
    }
}
