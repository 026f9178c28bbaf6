//! Supplemental bitfield bookkeeping backing the delegator and the upload
//! path: which pieces are needed, which are fully verified ("have"), and
//! which chunks have been durably written so far.

use bitvec::order::Msb0;
use bitvec::vec::BitVec;

use torrent_core::lengths::{ChunkInfo, Lengths, ValidPieceIndex};

/// Bitfield type used on the wire and for piece/chunk bookkeeping: MSB-first
/// within each byte, matching the wire BITFIELD message layout.
pub type Bitfield = BitVec<u8, Msb0>;

pub enum ChunkMarkingResult {
    PreviouslyCompleted,
    NotCompleted,
    Completed,
}

pub struct PieceTracker {
    needed: Bitfield,
    have: Bitfield,
    chunk_status: Bitfield,
    lengths: Lengths,
    priority_piece_ids: Vec<usize>,
}

impl PieceTracker {
    /// `needed` starts as the complement of whatever pieces the caller
    /// already has on disk (verified or not is up to the caller's policy).
    pub fn new(lengths: Lengths, needed: Bitfield) -> Self {
        let chunk_status = compute_chunk_status(&lengths, &needed);
        let priority_piece_ids = needed
            .iter()
            .enumerate()
            .filter_map(|(id, b)| if *b { Some(id) } else { None })
            .last()
            .into_iter()
            .collect();
        PieceTracker {
            have: Bitfield::repeat(false, lengths.total_pieces() as usize),
            needed,
            chunk_status,
            lengths,
            priority_piece_ids,
        }
    }

    pub fn lengths(&self) -> &Lengths {
        &self.lengths
    }

    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    pub fn needed(&self) -> &Bitfield {
        &self.needed
    }

    pub fn reserve_needed_piece(&mut self, index: ValidPieceIndex) {
        self.needed.set(index.get() as usize, false);
    }

    pub fn mark_piece_downloaded(&mut self, index: ValidPieceIndex) {
        self.have.set(index.get() as usize, true);
    }

    pub fn mark_piece_broken_if_not_have(&mut self, index: ValidPieceIndex) {
        if *self.have.get(index.get() as usize).unwrap_or(&false) {
            return;
        }
        tracing::debug!(piece = index.get(), "remarking piece as broken");
        self.needed.set(index.get() as usize, true);
        if let Some(mut s) = self.chunk_status.get_mut(self.lengths.chunk_range(index)) {
            s.fill(false);
        }
    }

    pub fn is_chunk_ready_to_upload(&self, chunk: &ChunkInfo) -> bool {
        self.have
            .get(chunk.piece_index.get() as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    /// Marks the bytes of one received chunk as written; returns whether
    /// this completes the whole piece.
    pub fn mark_chunk_downloaded(
        &mut self,
        piece_index: ValidPieceIndex,
        begin: u32,
        len: u32,
    ) -> Option<ChunkMarkingResult> {
        let chunk_info = self
            .lengths
            .chunk_info_from_received_data(piece_index, begin, len)?;
        let range = self.lengths.chunk_range(chunk_info.piece_index);
        let mut bits = self.chunk_status.get_mut(range)?;
        if bits.all() {
            return Some(ChunkMarkingResult::PreviouslyCompleted);
        }
        bits.set(chunk_info.chunk_index as usize, true);
        if bits.all() {
            Some(ChunkMarkingResult::Completed)
        } else {
            Some(ChunkMarkingResult::NotCompleted)
        }
    }

    /// Needed pieces, with a small set of priority indices (the last needed
    /// piece, since index/metadata sometimes lives there) surfaced first.
    pub fn iter_needed_pieces(&self) -> impl Iterator<Item = usize> + '_ {
        self.priority_piece_ids
            .iter()
            .copied()
            .filter(move |id| self.needed[*id])
            .chain(
                self.needed
                    .iter_ones()
                    .filter(move |id| !self.priority_piece_ids.contains(id)),
            )
    }
}

fn compute_chunk_status(lengths: &Lengths, needed: &Bitfield) -> Bitfield {
    let mut chunk_bf = Bitfield::repeat(false, lengths.chunk_bitfield_bytes() * 8);
    for piece in lengths.iter_piece_infos() {
        let chunks = lengths.chunks_per_piece(piece.piece_index) as usize;
        let offset = piece.piece_index.get() as usize * lengths.default_chunks_per_piece() as usize;
        let range = offset..offset + chunks;
        if !needed[piece.piece_index.get() as usize] {
            if let Some(mut s) = chunk_bf.get_mut(range) {
                s.fill(true);
            }
        }
    }
    chunk_bf
}
