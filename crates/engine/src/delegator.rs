//! Delegator (C4): picks the next block a given peer can serve, preferring
//! to finish pieces already in flight before starting new ones, and
//! switches to aggressive (endgame) mode near completion.

use torrent_core::constants::CHUNK_SIZE;
use torrent_core::lengths::Lengths;

use crate::block::{Block, BlockList, PeerHandle, TransferList};
use crate::piece_tracker::{Bitfield, PieceTracker};
use crate::request_list::PieceRequest;

pub struct Delegator {
    transfer_list: TransferList,
    tracker: PieceTracker,
    aggressive: bool,
}

impl Delegator {
    pub fn new(tracker: PieceTracker) -> Self {
        Delegator {
            transfer_list: TransferList::new(),
            tracker,
            aggressive: false,
        }
    }

    pub fn lengths(&self) -> &Lengths {
        self.tracker.lengths()
    }

    pub fn tracker(&self) -> &PieceTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut PieceTracker {
        &mut self.tracker
    }

    pub fn transfer_list(&self) -> &TransferList {
        &self.transfer_list
    }

    pub fn transfer_list_mut(&mut self) -> &mut TransferList {
        &mut self.transfer_list
    }

    pub fn is_aggressive(&self) -> bool {
        self.aggressive
    }

    /// Endgame switch: monotone, once set stays set until the torrent
    /// closes.
    pub fn maybe_enter_aggressive(&mut self, chunks_completed: u32, pieces_in_transfer: u32) {
        if self.aggressive {
            return;
        }
        let total = self.tracker.lengths().total_chunks();
        if chunks_completed + pieces_in_transfer + 5 >= total {
            tracing::info!("entering aggressive (endgame) mode");
            self.aggressive = true;
        }
    }

    /// Maximum number of concurrent transfers a single block may have
    /// before this peer should instead look for a different block.
    fn aggression_level(&self) -> usize {
        if self.aggressive {
            2
        } else {
            1
        }
    }

    /// Picks a block this peer can serve and begins a transfer on it,
    /// returning the request to send. `has_piece` reports whether the peer's
    /// bitfield claims a given piece index.
    pub fn delegate(
        &mut self,
        peer: PeerHandle,
        has_piece: impl Fn(usize) -> bool,
    ) -> Option<PieceRequest> {
        let max_transfers = self.aggression_level();

        for piece_index in self.transfer_list.piece_indices().collect::<Vec<_>>() {
            if !has_piece(piece_index as usize) {
                continue;
            }
            let list = self.transfer_list.get_mut(piece_index).unwrap();
            for block in &mut list.blocks {
                if block.finished {
                    continue;
                }
                if block.transfer_count() < max_transfers {
                    block.begin_transfer(peer);
                    return Some(block.piece);
                }
            }
        }

        let lengths = *self.tracker.lengths();
        let piece_index = self
            .tracker
            .iter_needed_pieces()
            .find(|&idx| has_piece(idx))?;
        let valid = lengths.validate_piece_index(piece_index as u32)?;
        self.tracker.reserve_needed_piece(valid);

        let piece_len = lengths.piece_length(valid);
        let mut blocks = Vec::new();
        let mut offset = 0u32;
        while offset < piece_len {
            let len = CHUNK_SIZE.min(piece_len - offset);
            blocks.push(Block::new(PieceRequest::new(piece_index as u32, offset, len)));
            offset += len;
        }

        let first_request = blocks.first()?.piece;
        let mut list = BlockList::new(piece_index as u32, blocks);
        list.blocks[0].begin_transfer(peer);
        self.transfer_list.insert(list);
        Some(first_request)
    }

    pub fn peer_bitfield_has(bitfield: &Bitfield, piece_index: usize) -> bool {
        bitfield.get(piece_index).map(|b| *b).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(total_len: u64, piece_len: u32) -> PieceTracker {
        let lengths = Lengths::new(total_len, piece_len).unwrap();
        let needed = Bitfield::repeat(true, lengths.total_pieces() as usize);
        PieceTracker::new(lengths, needed)
    }

    #[test]
    fn test_delegate_new_piece() {
        let mut d = Delegator::new(tracker(16384, 16384));
        let req = d.delegate(PeerHandle(1), |_| true).unwrap();
        assert_eq!(req.index, 0);
        assert_eq!(d.transfer_list().len(), 1);
    }

    #[test]
    fn test_delegate_prefers_in_progress_piece() {
        let mut d = Delegator::new(tracker(16384 * 2, 16384));
        let first = d.delegate(PeerHandle(1), |_| true).unwrap();
        // Same peer asks again: since aggression level is 1 and the first
        // block already has a transfer, it should move to a new piece.
        let second = d.delegate(PeerHandle(2), |_| true).unwrap();
        assert_ne!(first.index, second.index);
    }

    #[test]
    fn test_aggressive_switch_is_monotone() {
        let mut d = Delegator::new(tracker(16384 * 10, 16384));
        d.maybe_enter_aggressive(10, 0);
        assert!(d.is_aggressive());
        d.maybe_enter_aggressive(0, 0);
        assert!(d.is_aggressive());
    }
}
