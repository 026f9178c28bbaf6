//! PeerConnection (C6): per-peer protocol state machine. This module is
//! transport-agnostic — it consumes decoded `Frame`s and produces the next
//! outgoing action, but owns no socket. The orchestrator drives the actual
//! read/write loop and feeds frames in, per the narrow-collaborator split
//! the storage and tracker interfaces use elsewhere in this crate.

use std::time::{Duration, Instant};

use peer_protocol::{Frame, Request};

use crate::error::{Error, Result};
use crate::piece_tracker::Bitfield;
use crate::request_list::{PieceRequest, RequestList};

/// Disconnect a peer that hasn't sent anything (not even a keepalive) in
/// this long.
pub const KEEPALIVE_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(240);
/// Send our own keepalive if we haven't written anything in this long.
pub const KEEPALIVE_SEND_INTERVAL: Duration = Duration::from_secs(120);
/// Minimum gap between choke/unchoke state flips sent to a single peer.
const CHOKE_CHANGE_THROTTLE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Choked,
    Unchoked,
    BecameInterested,
    BecameNotInterested,
    Have(u32),
    BitfieldReplaced,
    IncomingRequest(PieceRequest),
    IncomingCancel(PieceRequest),
    /// A full block arrived for a request we had outstanding; `matched_fifo`
    /// tells the caller whether it lined up with the head of our
    /// `RequestList` or must be treated as an unsolicited/stale delivery.
    BlockReceived {
        request: PieceRequest,
        block: bytes::Bytes,
        matched_fifo: bool,
    },
}

/// What `PeerConnection::next_write_action` wants written next, in priority
/// order: state-change messages first, then queued HAVEs, then at most one
/// PIECE per call so a single upload never starves everything else queued
/// behind it.
#[derive(Debug)]
pub enum WriteAction {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Request(Request),
    Have(u32),
    Piece { index: u32, begin: u32 },
    Keepalive,
}

/// Inputs to the request-emission step of `next_write_action` that this
/// connection doesn't track itself: current download rate and whether the
/// torrent as a whole has entered endgame, both owned by the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub rate_bytes_per_sec: u64,
    pub aggressive: bool,
    pub overall_download_rate: u64,
    pub endgame_threshold: u64,
}

/// Target number of outstanding requests for a peer sending at
/// `rate_bytes_per_sec`: floor of 2, growing by one chunk-sized block per
/// additional 16 KiB/s. Endgame mode caps the pipeline instead of letting it
/// grow further, since the same blocks are already being requested from
/// multiple peers.
pub fn pipe_size(rate_bytes_per_sec: u64, aggressive: bool) -> usize {
    let scaled = 2 + (rate_bytes_per_sec / 16_384) as usize;
    if aggressive {
        scaled.min(4)
    } else {
        scaled
    }
}

pub struct PeerConnection {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    peer_bitfield: Bitfield,
    queued_haves: std::collections::VecDeque<u32>,
    pending_uploads: std::collections::VecDeque<PieceRequest>,
    queued_requests: std::collections::VecDeque<PieceRequest>,

    pub outstanding: RequestList,

    last_choke_change_sent: Option<Instant>,
    choke_dirty: bool,
    interest_dirty: bool,

    last_received: Instant,
    last_sent: Instant,
}

impl PeerConnection {
    pub fn new(num_pieces: usize, stall_threshold: u32) -> Self {
        let now = Instant::now();
        PeerConnection {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_bitfield: Bitfield::repeat(false, num_pieces),
            queued_haves: std::collections::VecDeque::new(),
            pending_uploads: std::collections::VecDeque::new(),
            queued_requests: std::collections::VecDeque::new(),
            outstanding: RequestList::new(stall_threshold),
            last_choke_change_sent: None,
            choke_dirty: false,
            interest_dirty: false,
            last_received: now,
            last_sent: now,
        }
    }

    pub fn peer_bitfield(&self) -> &Bitfield {
        &self.peer_bitfield
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.peer_bitfield.get(index).map(|b| *b).unwrap_or(false)
    }

    pub fn note_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now.duration_since(self.last_received) > KEEPALIVE_DISCONNECT_TIMEOUT
    }

    pub fn needs_keepalive(&self, now: Instant) -> bool {
        now.duration_since(self.last_sent) > KEEPALIVE_SEND_INTERVAL
    }

    fn validate_index(&self, index: u32) -> Result<()> {
        if (index as usize) < self.peer_bitfield.len() {
            Ok(())
        } else {
            Err(Error::ProtocolBadPieceIndex {
                index,
                total: self.peer_bitfield.len() as u32,
            })
        }
    }

    /// Applies a decoded frame, returning the higher-level event an
    /// orchestrator cares about (bookkeeping like HAVE/BITFIELD is applied
    /// here directly and surfaced too, for logging). A protocol violation
    /// (out-of-range index, mismatched bitfield length) is returned as an
    /// error; the caller disconnects the peer on it.
    pub fn on_frame(&mut self, frame: Frame, now: Instant) -> Result<Option<PeerEvent>> {
        self.note_received(now);
        Ok(match frame {
            Frame::KeepAlive => None,
            Frame::Choke => {
                self.peer_choking = true;
                self.outstanding.cancel();
                Some(PeerEvent::Choked)
            }
            Frame::Unchoke => {
                self.peer_choking = false;
                Some(PeerEvent::Unchoked)
            }
            Frame::Interested => {
                self.peer_interested = true;
                Some(PeerEvent::BecameInterested)
            }
            Frame::NotInterested => {
                self.peer_interested = false;
                self.pending_uploads.clear();
                Some(PeerEvent::BecameNotInterested)
            }
            Frame::Have(index) => {
                self.validate_index(index)?;
                *self.peer_bitfield.get_mut(index as usize).unwrap() = true;
                Some(PeerEvent::Have(index))
            }
            Frame::Bitfield(bytes) => {
                let expected = self.peer_bitfield.len().div_ceil(8);
                let got = bytes.as_ref().len();
                if got != expected {
                    return Err(Error::ProtocolBadBitfieldLen { got, expected });
                }
                let mut incoming = Bitfield::from_vec(bytes.as_ref().to_vec());
                incoming.truncate(self.peer_bitfield.len());
                self.peer_bitfield = incoming;
                Some(PeerEvent::BitfieldReplaced)
            }
            Frame::Request(Request {
                index,
                begin,
                length,
            }) => {
                self.validate_index(index)?;
                let req = PieceRequest::new(index, begin, length);
                if !self.am_choking {
                    self.pending_uploads.push_back(req);
                }
                Some(PeerEvent::IncomingRequest(req))
            }
            Frame::Cancel(Request {
                index,
                begin,
                length,
            }) => {
                self.validate_index(index)?;
                let req = PieceRequest::new(index, begin, length);
                self.pending_uploads.retain(|r| *r != req);
                Some(PeerEvent::IncomingCancel(req))
            }
            Frame::Piece { index, begin, block } => {
                self.validate_index(index)?;
                let length = block.len() as u32;
                let request = PieceRequest::new(index, begin, length);
                let matched_fifo = self.outstanding.downloading(request);
                Some(PeerEvent::BlockReceived {
                    request,
                    block: block.0,
                    matched_fifo,
                })
            }
        })
    }

    pub fn set_am_choking(&mut self, choking: bool) {
        if self.am_choking != choking {
            self.am_choking = choking;
            self.choke_dirty = true;
            if choking {
                self.pending_uploads.clear();
            }
        }
    }

    pub fn set_am_interested(&mut self, interested: bool) {
        if self.am_interested != interested {
            self.am_interested = interested;
            self.interest_dirty = true;
        }
    }

    pub fn queue_have(&mut self, index: u32) {
        self.queued_haves.push_back(index);
    }

    /// Commits a block delegated to this peer to be sent as a REQUEST on a
    /// future call to `next_write_action`. Counted alongside `outstanding`
    /// when the caller decides how much more to delegate this peer.
    pub fn queue_request(&mut self, request: PieceRequest) {
        self.queued_requests.push_back(request);
    }

    pub fn queued_request_count(&self) -> usize {
        self.queued_requests.len()
    }

    /// §4.4's `should_request(stall)`: outside endgame we keep requesting as
    /// long as the peer will actually serve us; in endgame we back off from
    /// peers that have stalled unless the overall download rate has itself
    /// dropped below the endgame threshold (in which case stalling is
    /// everywhere, and backing off would just stop progress entirely).
    fn should_request(&self, ctx: &RequestContext) -> bool {
        if self.peer_choking || !self.am_interested {
            return false;
        }
        if !ctx.aggressive {
            return true;
        }
        !self.outstanding.is_stalled() || ctx.overall_download_rate < ctx.endgame_threshold
    }

    pub fn has_pending_upload(&self) -> bool {
        !self.pending_uploads.is_empty()
    }

    pub fn peek_pending_upload(&self) -> Option<PieceRequest> {
        self.pending_uploads.front().copied()
    }

    pub fn pop_pending_upload(&mut self) -> Option<PieceRequest> {
        self.pending_uploads.pop_front()
    }

    /// Picks the next thing to write, in the priority order described for
    /// the connection's write path: throttled choke state, interest state,
    /// a REQUEST if `should_request`/`pipe_size` allow one, queued HAVEs,
    /// then a single piece upload. Returns `None` once there's nothing left
    /// to say (the caller should then consider sending a keepalive via
    /// `needs_keepalive`).
    pub fn next_write_action(&mut self, now: Instant, ctx: &RequestContext) -> Option<WriteAction> {
        if self.choke_dirty {
            let throttled = self
                .last_choke_change_sent
                .is_some_and(|t| now.duration_since(t) < CHOKE_CHANGE_THROTTLE);
            if !throttled {
                self.choke_dirty = false;
                self.last_choke_change_sent = Some(now);
                self.last_sent = now;
                return Some(if self.am_choking {
                    WriteAction::Choke
                } else {
                    WriteAction::Unchoke
                });
            }
        }

        if self.interest_dirty {
            self.interest_dirty = false;
            self.last_sent = now;
            return Some(if self.am_interested {
                WriteAction::Interested
            } else {
                WriteAction::NotInterested
            });
        }

        if self.should_request(ctx)
            && self.outstanding.len() < pipe_size(ctx.rate_bytes_per_sec, ctx.aggressive)
        {
            if let Some(req) = self.queued_requests.pop_front() {
                self.outstanding.push(req);
                self.last_sent = now;
                return Some(WriteAction::Request(Request::new(
                    req.index, req.offset, req.length,
                )));
            }
        }

        if let Some(index) = self.queued_haves.pop_front() {
            self.last_sent = now;
            return Some(WriteAction::Have(index));
        }

        if let Some(req) = self.pending_uploads.pop_front() {
            self.last_sent = now;
            return Some(WriteAction::Piece {
                index: req.index,
                begin: req.offset,
            });
        }

        None
    }

    pub fn mark_keepalive_sent(&mut self, now: Instant) {
        self.last_sent = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_requests_ctx() -> RequestContext {
        RequestContext {
            rate_bytes_per_sec: 0,
            aggressive: false,
            overall_download_rate: 0,
            endgame_threshold: 0,
        }
    }

    #[test]
    fn test_have_and_bitfield_update_peer_view() {
        let mut pc = PeerConnection::new(4, 5);
        let now = Instant::now();
        pc.on_frame(Frame::Have(2), now).unwrap();
        assert!(pc.has_piece(2));
        assert!(!pc.has_piece(0));

        pc.on_frame(Frame::Bitfield(vec![0b1000_0000].into()), now)
            .unwrap();
        assert!(pc.has_piece(0));
        assert!(!pc.has_piece(2));
    }

    #[test]
    fn test_have_out_of_range_is_protocol_error() {
        let mut pc = PeerConnection::new(4, 5);
        let now = Instant::now();
        assert!(matches!(
            pc.on_frame(Frame::Have(9), now),
            Err(Error::ProtocolBadPieceIndex { index: 9, total: 4 })
        ));
    }

    #[test]
    fn test_bitfield_wrong_length_is_protocol_error() {
        let mut pc = PeerConnection::new(4, 5);
        let now = Instant::now();
        assert!(matches!(
            pc.on_frame(Frame::Bitfield(vec![0u8; 2].into()), now),
            Err(Error::ProtocolBadBitfieldLen {
                got: 2,
                expected: 1
            })
        ));
    }

    #[test]
    fn test_choke_change_is_throttled() {
        let mut pc = PeerConnection::new(1, 5);
        let t0 = Instant::now();
        pc.set_am_choking(false);
        let first = pc.next_write_action(t0, &no_requests_ctx());
        assert!(matches!(first, Some(WriteAction::Unchoke)));

        pc.set_am_choking(true);
        // Too soon: choke_dirty is set but throttle blocks it.
        assert!(pc.next_write_action(t0, &no_requests_ctx()).is_none());
    }

    #[test]
    fn test_request_becomes_pending_upload_unless_choking() {
        let mut pc = PeerConnection::new(1, 5);
        let now = Instant::now();
        pc.set_am_choking(false);
        let _ = pc.next_write_action(now, &no_requests_ctx());
        pc.on_frame(Frame::Request(Request::new(0, 0, 16384)), now)
            .unwrap();
        assert!(pc.has_pending_upload());

        pc.set_am_choking(true);
        assert!(!pc.has_pending_upload());
    }

    #[test]
    fn test_cancel_removes_pending_upload() {
        let mut pc = PeerConnection::new(1, 5);
        let now = Instant::now();
        pc.set_am_choking(false);
        let _ = pc.next_write_action(now, &no_requests_ctx());
        pc.on_frame(Frame::Request(Request::new(0, 0, 16384)), now)
            .unwrap();
        pc.on_frame(Frame::Cancel(Request::new(0, 0, 16384)), now)
            .unwrap();
        assert!(!pc.has_pending_upload());
    }

    #[test]
    fn test_block_received_matches_fifo() {
        let mut pc = PeerConnection::new(1, 5);
        let now = Instant::now();
        pc.outstanding.push(PieceRequest::new(0, 0, 5));
        let event = pc.on_frame(
            Frame::Piece {
                index: 0,
                begin: 0,
                block: b"hello".to_vec().into(),
            },
            now,
        )
        .unwrap();
        assert!(matches!(
            event,
            Some(PeerEvent::BlockReceived {
                matched_fifo: true,
                ..
            })
        ));
    }

    #[test]
    fn test_stale_detection() {
        let pc = PeerConnection::new(1, 5);
        let far_future = Instant::now() + KEEPALIVE_DISCONNECT_TIMEOUT + Duration::from_secs(1);
        assert!(pc.is_stale(far_future));
    }

    #[test]
    fn test_pipe_size_floor_and_growth() {
        assert_eq!(pipe_size(0, false), 2);
        assert_eq!(pipe_size(32_768, false), 4);
        // Endgame caps the pipeline instead of letting it keep growing.
        assert_eq!(pipe_size(1_000_000, true), 4);
    }

    #[test]
    fn test_queued_request_emitted_once_unchoked_and_interested() {
        let mut pc = PeerConnection::new(4, 5);
        let now = Instant::now();
        pc.on_frame(Frame::Unchoke, now).unwrap();
        pc.set_am_interested(true);
        pc.queue_request(PieceRequest::new(0, 0, 16384));

        // Drain the interest-change write first.
        let _ = pc.next_write_action(now, &no_requests_ctx());

        let action = pc.next_write_action(now, &no_requests_ctx());
        assert!(matches!(
            action,
            Some(WriteAction::Request(Request {
                index: 0,
                begin: 0,
                length: 16384
            }))
        ));
        assert_eq!(pc.outstanding.len(), 1);
        assert_eq!(pc.queued_request_count(), 0);
    }

    #[test]
    fn test_no_request_emitted_while_peer_choking_us() {
        let mut pc = PeerConnection::new(4, 5);
        let now = Instant::now();
        pc.set_am_interested(true);
        pc.queue_request(PieceRequest::new(0, 0, 16384));
        let _ = pc.next_write_action(now, &no_requests_ctx());
        assert!(pc.next_write_action(now, &no_requests_ctx()).is_none());
        assert_eq!(pc.queued_request_count(), 1);
    }

    #[test]
    fn test_pipe_size_gates_request_emission() {
        let mut pc = PeerConnection::new(4, 5);
        let now = Instant::now();
        pc.on_frame(Frame::Unchoke, now).unwrap();
        pc.set_am_interested(true);
        pc.queue_request(PieceRequest::new(0, 0, 16384));
        let _ = pc.next_write_action(now, &no_requests_ctx());

        // outstanding is already at the (zero-rate) pipe size of 2... fill it.
        pc.outstanding.push(PieceRequest::new(0, 16384, 16384));
        pc.outstanding.push(PieceRequest::new(0, 32768, 16384));
        assert!(pc.next_write_action(now, &no_requests_ctx()).is_none());
        assert_eq!(pc.queued_request_count(), 1);
    }

    #[test]
    fn test_should_request_backs_off_stalled_peer_in_endgame() {
        let mut pc = PeerConnection::new(4, 2);
        let now = Instant::now();
        pc.on_frame(Frame::Unchoke, now).unwrap();
        pc.set_am_interested(true);
        pc.queue_request(PieceRequest::new(0, 0, 16384));
        let _ = pc.next_write_action(now, &no_requests_ctx());

        pc.outstanding.stall();
        pc.outstanding.stall();
        pc.outstanding.stall();
        assert!(pc.outstanding.is_stalled());

        let aggressive_ctx = RequestContext {
            rate_bytes_per_sec: 0,
            aggressive: true,
            overall_download_rate: 10_000,
            endgame_threshold: 1_000,
        };
        assert!(pc.next_write_action(now, &aggressive_ctx).is_none());

        // But if the whole torrent has slowed below the endgame threshold,
        // stalling this one peer shouldn't stop requesting from it.
        let slow_overall_ctx = RequestContext {
            overall_download_rate: 500,
            ..aggressive_ctx
        };
        assert!(pc.next_write_action(now, &slow_overall_ctx).is_some());
    }
}
