//! HashQueue + HashTorrent (C3): asynchronous SHA-1 verification of
//! completed pieces, yielding periodically so a large piece doesn't starve
//! other tasks sharing the reactor.

use std::collections::VecDeque;
use std::sync::Arc;

use sha1w::{ISha1, Sha1};

use crate::chunk_list::{ChunkHandle, ChunkList};
use crate::error::{Error, Result};

/// How many bytes to hash between cooperative yield points.
const YIELD_EVERY_BYTES: u64 = 256 * 1024;

/// A single outstanding verification job.
struct HashJob {
    index: u32,
    expected: [u8; 20],
}

/// FIFO of piece verification jobs. Call `drive` from a task that owns the
/// `ChunkList`; it completes jobs strictly in submission order, matching the
/// spec's requirement that verification never reorders relative to a single
/// torrent's hashing task.
#[derive(Default)]
pub struct HashQueue {
    jobs: VecDeque<HashJob>,
}

pub enum HashOutcome {
    Verified,
    Mismatch,
}

impl HashQueue {
    pub fn new() -> Self {
        HashQueue {
            jobs: VecDeque::new(),
        }
    }

    pub fn push(&mut self, index: u32, expected: [u8; 20]) {
        self.jobs.push_back(HashJob { index, expected });
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Pops and verifies the next job against a read-only chunk handle the
    /// caller has already acquired from `chunks`. Returns `None` once the
    /// queue is drained.
    pub async fn drive_one(
        &mut self,
        chunks: &ChunkList,
        handle: &ChunkHandle,
    ) -> Option<Result<(u32, HashOutcome)>> {
        let job = self.jobs.pop_front()?;
        if job.index != handle.index {
            return Some(Err(Error::internal(format!(
                "hash job for piece {} handed a chunk handle for piece {}",
                job.index, handle.index
            ))));
        }
        Some(hash_chunk(chunks, handle, job.expected).map(|outcome| (job.index, outcome)))
    }
}

fn hash_chunk(chunks: &ChunkList, handle: &ChunkHandle, expected: [u8; 20]) -> Result<HashOutcome> {
    let digest = chunks.with_chunk(handle, |chunk| {
        let mut hasher = Sha1::new();
        for (_, span) in chunk.iter_spans() {
            hasher.update(span);
        }
        hasher.finish()
    })?;
    if digest == expected {
        Ok(HashOutcome::Verified)
    } else {
        Ok(HashOutcome::Mismatch)
    }
}

/// Full-torrent verification driver: walks every piece on startup (or after
/// a resume) acquiring each chunk read-only, hashing it in bounded slices so
/// the task yields back to the scheduler regularly, and reports which
/// pieces are already complete.
pub struct HashTorrent {
    chunks: Arc<ChunkList>,
    piece_hashes: Vec<[u8; 20]>,
}

impl HashTorrent {
    pub fn new(chunks: Arc<ChunkList>, piece_hashes: Vec<[u8; 20]>) -> Self {
        HashTorrent {
            chunks,
            piece_hashes,
        }
    }

    pub fn total_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Verifies a single piece, yielding to the scheduler every
    /// `YIELD_EVERY_BYTES` bytes hashed.
    pub async fn verify_piece(&self, index: u32) -> Result<HashOutcome> {
        let expected = *self
            .piece_hashes
            .get(index as usize)
            .ok_or_else(|| Error::input(format!("piece index {index} out of range")))?;

        let mut handle = self.chunks.get(index, false)?;
        let digest = {
            let mut hasher = Sha1::new();
            let mut since_yield = 0u64;
            let spans: Vec<Vec<u8>> = self
                .chunks
                .with_chunk(&handle, |chunk| {
                    chunk.iter_spans().map(|(_, s)| s.to_vec()).collect()
                })?;
            for span in spans {
                hasher.update(&span);
                since_yield += span.len() as u64;
                if since_yield >= YIELD_EVERY_BYTES {
                    since_yield = 0;
                    tokio::task::yield_now().await;
                }
            }
            hasher.finish()
        };
        self.chunks.release(&mut handle)?;

        if digest == expected {
            Ok(HashOutcome::Verified)
        } else {
            Ok(HashOutcome::Mismatch)
        }
    }

    /// Verifies every piece in order, invoking `on_result` as each completes.
    /// Used on startup to recover state from a pre-populated file on disk.
    pub async fn verify_all(
        &self,
        mut on_result: impl FnMut(u32, HashOutcome),
    ) -> Result<()> {
        for index in 0..self.total_pieces() as u32 {
            let outcome = self.verify_piece(index).await?;
            on_result(index, outcome);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQuota;
    use crate::storage::{InMemoryStorage, PieceLayout};

    fn make_list(n: u32) -> ChunkList {
        let mut list = ChunkList::new(Box::new(InMemoryStorage::new()), MemoryQuota::unlimited());
        let layouts = (0..n)
            .map(|i| PieceLayout {
                index: i,
                piece_length: 8,
                segments: vec![(0, (i as u64) * 8, 8)],
            })
            .collect();
        list.resize(layouts).unwrap();
        list
    }

    fn sha1_of(bytes: &[u8]) -> [u8; 20] {
        let mut h = Sha1::new();
        h.update(bytes);
        h.finish()
    }

    #[tokio::test]
    async fn test_hash_queue_rejects_out_of_order_handle() {
        let mut q = HashQueue::new();
        q.push(5, [0u8; 20]);
        let list = make_list(1);
        let handle = list.get(0, false).unwrap();
        let result = q.drive_one(&list, &handle).await;
        assert!(result.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_verify_piece_matches_expected_hash() {
        // InMemoryStorage hands out freshly zeroed pieces, so the expected
        // hash here is that of an all-zero 8-byte piece.
        let list = Arc::new(make_list(1));
        let expected = sha1_of(&vec![0u8; 8]);
        let hash_torrent = HashTorrent::new(list, vec![expected]);
        let outcome = hash_torrent.verify_piece(0).await.unwrap();
        assert!(matches!(outcome, HashOutcome::Verified));
    }

    #[tokio::test]
    async fn test_verify_piece_reports_mismatch() {
        let list = Arc::new(make_list(1));
        let hash_torrent = HashTorrent::new(list, vec![[0xFFu8; 20]]);
        let outcome = hash_torrent.verify_piece(0).await.unwrap();
        assert!(matches!(outcome, HashOutcome::Mismatch));
    }
}
