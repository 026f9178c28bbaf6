//! Delegator, TransferList, Block (C4): per-piece block ownership,
//! multi-leader endgame reconciliation, and failed-data memoization.

use std::collections::HashMap;

use crate::chunk::Chunk;
use crate::error::Result;
use crate::request_list::PieceRequest;

/// A stable, non-owning reference to a peer connection, used instead of a
/// back-pointer so `Block`/`BlockTransfer` don't need to know about
/// `PeerConnection` at all. Handed out by whatever owns the connection list
/// (`DownloadMain`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Leader,
    NotLeader,
    Erased,
    Finished,
}

#[derive(Debug)]
pub struct BlockTransfer {
    pub peer: PeerHandle,
    pub position: u32,
    pub state: TransferState,
    /// Set once this transfer's bytes were observed to disagree with the
    /// leader's. The transfer keeps being fed bytes (to stay framed on the
    /// wire) but nothing it sends is stored. A candidate for banning, a
    /// decision left to policy outside this module.
    pub dissimilar: bool,
}

pub enum BlockProgress {
    Continuing,
    Finished,
}

struct FailedEntry {
    buffer: Vec<u8>,
    popularity: u32,
}

/// State of one block (sub-piece transfer unit) inside a piece.
pub struct Block {
    /// This block's location: `index` identifies the piece, `offset`/`length`
    /// locate it within the piece.
    pub piece: PieceRequest,
    transfers: Vec<BlockTransfer>,
    leader: Option<usize>,
    pub finished: bool,
    failed_list: Vec<FailedEntry>,
}

impl Block {
    pub fn new(piece: PieceRequest) -> Self {
        Block {
            piece,
            transfers: Vec::new(),
            leader: None,
            finished: false,
            failed_list: Vec::new(),
        }
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers
            .iter()
            .filter(|t| !matches!(t.state, TransferState::Erased))
            .count()
    }

    pub fn begin_transfer(&mut self, peer: PeerHandle) -> usize {
        self.transfers.push(BlockTransfer {
            peer,
            position: 0,
            state: TransferState::Queued,
            dissimilar: false,
        });
        self.transfers.len() - 1
    }

    /// Feeds `bytes` received at the current position of `transfer_idx` into
    /// the piece's chunk, applying the leader/non-leader reconciliation
    /// rules. `chunk` is the whole piece's backing storage; this block's
    /// bytes live at `[piece.offset .. piece.offset + piece.length)` in it.
    pub fn on_bytes(
        &mut self,
        transfer_idx: usize,
        bytes: &[u8],
        chunk: &mut Chunk,
    ) -> Result<BlockProgress> {
        if matches!(self.transfers[transfer_idx].state, TransferState::Queued) {
            if self.leader.is_none() {
                self.transfers[transfer_idx].state = TransferState::Leader;
                self.leader = Some(transfer_idx);
            } else {
                self.transfers[transfer_idx].state = TransferState::NotLeader;
            }
        }

        let position = self.transfers[transfer_idx].position as u64;
        let chunk_offset = self.piece.offset as u64 + position;

        match self.transfers[transfer_idx].state {
            TransferState::Leader => {
                chunk.from_buffer(bytes, chunk_offset, bytes.len())?;
            }
            TransferState::NotLeader => {
                let matches = chunk.compare_buffer(bytes, chunk_offset, bytes.len())?;
                if !matches {
                    self.transfers[transfer_idx].dissimilar = true;
                }
            }
            TransferState::Erased | TransferState::Finished => {
                // Bytes for a transfer we no longer care about; consumed to
                // stay framed, never stored.
            }
        }

        self.transfers[transfer_idx].position += bytes.len() as u32;

        if matches!(self.transfers[transfer_idx].state, TransferState::NotLeader)
            && !self.transfers[transfer_idx].dissimilar
        {
            if let Some(leader_idx) = self.leader {
                if self.transfers[transfer_idx].position > self.transfers[leader_idx].position {
                    self.transfers[leader_idx].state = TransferState::NotLeader;
                    self.transfers[transfer_idx].state = TransferState::Leader;
                    self.leader = Some(transfer_idx);
                }
            }
        }

        if self.leader == Some(transfer_idx)
            && self.transfers[transfer_idx].position >= self.piece.length
        {
            self.transfers[transfer_idx].state = TransferState::Finished;
            self.finished = true;
            return Ok(BlockProgress::Finished);
        }
        Ok(BlockProgress::Continuing)
    }

    /// Marks the transfer from `peer`, if any, as erased (peer disconnect or
    /// explicit cancel). If it was the leader, leadership is released; the
    /// block must be re-delegated for a new leader to appear.
    pub fn erase_peer(&mut self, peer: PeerHandle) {
        for (idx, t) in self.transfers.iter_mut().enumerate() {
            if t.peer == peer && !matches!(t.state, TransferState::Erased) {
                t.state = TransferState::Erased;
                if self.leader == Some(idx) {
                    self.leader = None;
                }
            }
        }
    }

    pub fn has_leader(&self) -> bool {
        self.leader.is_some()
    }

    /// Records this block's current chunk bytes as a failed attempt: if
    /// they match a previously-seen failure, bump its popularity; otherwise
    /// add a new entry with popularity 1.
    pub fn record_failure(&mut self, chunk: &Chunk) -> Result<()> {
        let mut buf = vec![0u8; self.piece.length as usize];
        chunk.to_buffer(&mut buf, self.piece.offset as u64, buf.len())?;
        if let Some(entry) = self.failed_list.iter_mut().find(|e| e.buffer == buf) {
            entry.popularity += 1;
        } else {
            self.failed_list.push(FailedEntry {
                buffer: buf,
                popularity: 1,
            });
        }
        Ok(())
    }

    pub fn most_popular_failed_buffer(&self) -> Option<&[u8]> {
        self.failed_list
            .iter()
            .max_by_key(|e| e.popularity)
            .map(|e| e.buffer.as_slice())
    }

    /// Forces the current leader (if any) to fail: erases its transfer so
    /// the block re-delegates on the next attempt. Used after a second
    /// consecutive hash failure, where no single peer can be blamed.
    pub fn fail_leader(&mut self) {
        if let Some(idx) = self.leader.take() {
            self.transfers[idx].state = TransferState::Erased;
        }
        self.finished = false;
    }
}

/// Ordered sequence of `Block`s for one piece.
pub struct BlockList {
    pub piece_index: u32,
    pub blocks: Vec<Block>,
    pub attempt: u32,
    pub failed: u32,
}

impl BlockList {
    pub fn new(piece_index: u32, blocks: Vec<Block>) -> Self {
        BlockList {
            piece_index,
            blocks,
            attempt: 0,
            failed: 0,
        }
    }

    pub fn all_finished(&self) -> bool {
        self.blocks.iter().all(|b| b.finished)
    }

    /// First-attempt hash failure: memoize each block's bytes, retry with
    /// the most popular recorded bytes per block, and stay queued for
    /// another hash pass.
    pub fn handle_first_failure(&mut self, chunk: &mut Chunk) -> Result<()> {
        self.failed += 1;
        self.attempt = 1;
        for block in &mut self.blocks {
            block.record_failure(chunk)?;
            if let Some(popular) = block.most_popular_failed_buffer() {
                let popular = popular.to_vec();
                chunk.from_buffer(&popular, block.piece.offset as u64, popular.len())?;
            }
            block.finished = true;
        }
        Ok(())
    }

    /// Second (or later) consecutive hash failure: give up guessing which
    /// peer was at fault, clear progress, and force re-delegation of every
    /// block from scratch.
    pub fn handle_repeated_failure(&mut self) {
        self.attempt = 0;
        for block in &mut self.blocks {
            block.fail_leader();
        }
    }
}

/// Set of in-progress `BlockList`s, keyed by piece index.
#[derive(Default)]
pub struct TransferList {
    in_progress: HashMap<u32, BlockList>,
}

impl TransferList {
    pub fn new() -> Self {
        TransferList::default()
    }

    pub fn insert(&mut self, list: BlockList) {
        self.in_progress.insert(list.piece_index, list);
    }

    pub fn get_mut(&mut self, piece_index: u32) -> Option<&mut BlockList> {
        self.in_progress.get_mut(&piece_index)
    }

    pub fn get(&self, piece_index: u32) -> Option<&BlockList> {
        self.in_progress.get(&piece_index)
    }

    pub fn remove(&mut self, piece_index: u32) -> Option<BlockList> {
        self.in_progress.remove(&piece_index)
    }

    pub fn contains(&self, piece_index: u32) -> bool {
        self.in_progress.contains_key(&piece_index)
    }

    pub fn len(&self) -> usize {
        self.in_progress.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_progress.is_empty()
    }

    pub fn piece_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.in_progress.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, ChunkPart};

    fn mem_chunk(size: usize) -> Chunk {
        Chunk::new(0, vec![ChunkPart::Memory(vec![0u8; size])])
    }

    #[test]
    fn test_leader_writes_directly() {
        let mut chunk = mem_chunk(8192);
        let mut block = Block::new(PieceRequest::new(3, 0, 8192));
        let a = block.begin_transfer(PeerHandle(1));

        let progress = block.on_bytes(a, &[1u8; 8192], &mut chunk).unwrap();
        assert!(matches!(progress, BlockProgress::Finished));
        assert!(block.finished);
    }

    #[test]
    fn test_non_leader_matching_is_discarded_silently() {
        let mut chunk = mem_chunk(8192);
        let mut block = Block::new(PieceRequest::new(3, 0, 8192));
        let a = block.begin_transfer(PeerHandle(1));
        let b = block.begin_transfer(PeerHandle(2));

        block.on_bytes(a, &[9u8; 8192], &mut chunk).unwrap();
        let progress = block.on_bytes(b, &[9u8; 8192], &mut chunk).unwrap();
        assert!(matches!(progress, BlockProgress::Continuing));
        assert!(!block.transfers[b].dissimilar);
    }

    #[test]
    fn test_non_leader_disagreeing_is_marked_dissimilar() {
        let mut chunk = mem_chunk(8192);
        let mut block = Block::new(PieceRequest::new(3, 0, 8192));
        let a = block.begin_transfer(PeerHandle(1));
        let b = block.begin_transfer(PeerHandle(2));

        block.on_bytes(a, &[9u8; 8192], &mut chunk).unwrap();
        block.on_bytes(b, &[1u8; 8192], &mut chunk).unwrap();
        assert!(block.transfers[b].dissimilar);
    }

    #[test]
    fn test_overtaking_transfer_becomes_new_leader() {
        let mut chunk = mem_chunk(16384);
        let mut block = Block::new(PieceRequest::new(3, 0, 16384));
        let a = block.begin_transfer(PeerHandle(1));
        let b = block.begin_transfer(PeerHandle(2));

        // A sends half, becomes leader.
        block.on_bytes(a, &[5u8; 8192], &mut chunk).unwrap();
        assert!(block.leader == Some(a));

        // B sends the whole block in one go (matching), overtaking A.
        block.on_bytes(b, &[5u8; 8192], &mut chunk).unwrap();
        let progress = block.on_bytes(b, &[5u8; 8192], &mut chunk).unwrap();
        assert!(matches!(progress, BlockProgress::Finished));
        assert_eq!(block.leader, Some(b));
    }

    #[test]
    fn test_erase_peer_drops_leadership() {
        let mut chunk = mem_chunk(8192);
        let mut block = Block::new(PieceRequest::new(3, 0, 8192));
        let a = block.begin_transfer(PeerHandle(1));
        block.on_bytes(a, &[1u8; 4096], &mut chunk).unwrap();
        assert!(block.has_leader());
        block.erase_peer(PeerHandle(1));
        assert!(!block.has_leader());
    }

    #[test]
    fn test_first_failure_then_second_failure() {
        let mut chunk = mem_chunk(8192);
        let mut block_a = Block::new(PieceRequest::new(7, 0, 4096));
        let mut block_b = Block::new(PieceRequest::new(7, 4096, 4096));
        let t_a = block_a.begin_transfer(PeerHandle(1));
        let t_b = block_b.begin_transfer(PeerHandle(1));
        block_a.on_bytes(t_a, &[1u8; 4096], &mut chunk).unwrap();
        block_b.on_bytes(t_b, &[2u8; 4096], &mut chunk).unwrap();

        let mut list = BlockList::new(7, vec![block_a, block_b]);
        assert!(list.all_finished());

        list.handle_first_failure(&mut chunk).unwrap();
        assert_eq!(list.attempt, 1);
        assert_eq!(list.failed, 1);
        assert!(list.all_finished());

        list.handle_repeated_failure();
        assert_eq!(list.attempt, 0);
        assert!(!list.all_finished());
        for b in &list.blocks {
            assert!(!b.has_leader());
        }
    }

    #[test]
    fn test_transfer_list_insert_remove() {
        let mut tl = TransferList::new();
        tl.insert(BlockList::new(1, vec![]));
        assert!(tl.contains(1));
        assert!(tl.remove(1).is_some());
        assert!(!tl.contains(1));
    }
}
