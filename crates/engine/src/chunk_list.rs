//! ChunkList + ChunkHandle (C2): indexed table of chunks with ref-counting,
//! a write-back queue, and periodic sync.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::storage::{ChunkFactory, PieceLayout};

/// Bitset of flags accepted by `ChunkList::sync_chunks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncFlags(u8);

impl SyncFlags {
    pub const NONE: SyncFlags = SyncFlags(0);
    pub const ALL: SyncFlags = SyncFlags(1 << 0);
    pub const USE_TIMEOUT: SyncFlags = SyncFlags(1 << 1);
    pub const SAFE: SyncFlags = SyncFlags(1 << 2);
    pub const SLOPPY: SyncFlags = SyncFlags(1 << 3);
    pub const FORCE: SyncFlags = SyncFlags(1 << 4);

    pub fn contains(self, other: SyncFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: SyncFlags) -> SyncFlags {
        SyncFlags(self.0 | other.0)
    }
}

impl std::ops::BitOr for SyncFlags {
    type Output = SyncFlags;
    fn bitor(self, rhs: Self) -> Self::Output {
        self.with(rhs)
    }
}

struct ChunkListNode {
    index: u32,
    chunk: Option<Chunk>,
    references: i32,
    writable: i32,
    time_modified: Instant,
    sync_triggered: bool,
    queued: bool,
}

impl ChunkListNode {
    fn new(index: u32) -> Self {
        ChunkListNode {
            index,
            chunk: None,
            references: 0,
            writable: 0,
            time_modified: Instant::now(),
            sync_triggered: false,
            queued: false,
        }
    }
}

/// A scoped borrow of a `ChunkListNode`. Must be returned via
/// `ChunkList::release`; dropping it without releasing is a logic error the
/// caller is responsible for avoiding (there is no owning back-pointer to
/// the list to release automatically into, since the list is usually held
/// behind a lock the handle itself doesn't want to take on drop).
pub struct ChunkHandle {
    pub index: u32,
    pub writable: bool,
    released: bool,
}

impl ChunkHandle {
    fn new(index: u32, writable: bool) -> Self {
        ChunkHandle {
            index,
            writable,
            released: false,
        }
    }
}

impl Drop for ChunkHandle {
    fn drop(&mut self) {
        if !self.released {
            tracing::error!(index = self.index, "ChunkHandle dropped without release");
        }
    }
}

pub struct ChunkList {
    nodes: Mutex<Vec<ChunkListNode>>,
    write_back: Mutex<VecDeque<u32>>,
    factory: Box<dyn ChunkFactory>,
    memory_quota: crate::memory::MemoryQuota,
    sync_timeout: Duration,
    layouts: Vec<PieceLayout>,
}

impl ChunkList {
    pub fn new(factory: Box<dyn ChunkFactory>, memory_quota: crate::memory::MemoryQuota) -> Self {
        ChunkList {
            nodes: Mutex::new(Vec::new()),
            write_back: Mutex::new(VecDeque::new()),
            factory,
            memory_quota,
            sync_timeout: Duration::from_secs(60),
            layouts: Vec::new(),
        }
    }

    pub fn resize(&mut self, layouts: Vec<PieceLayout>) -> Result<()> {
        let mut nodes = self.nodes.lock();
        if !nodes.is_empty() {
            return Err(Error::internal("ChunkList::resize called on non-empty list"));
        }
        *nodes = (0..layouts.len() as u32).map(ChunkListNode::new).collect();
        self.layouts = layouts;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u32, writable: bool) -> Result<ChunkHandle> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(index as usize)
            .ok_or_else(|| Error::internal(format!("no such chunk index {index}")))?;

        if node.chunk.is_none() {
            let layout = &self.layouts[index as usize];
            if !self.memory_quota.allocate(layout.piece_length) {
                return Err(Error::OutOfMemory {
                    requested_bytes: layout.piece_length,
                });
            }
            match self.factory.create(layout, writable) {
                Ok(chunk) => node.chunk = Some(chunk),
                Err(e) => {
                    self.memory_quota.deallocate(layout.piece_length);
                    return Err(e);
                }
            }
        } else if writable && !node.chunk.as_ref().unwrap().is_writable() {
            let layout = &self.layouts[index as usize];
            node.chunk = Some(self.factory.create(layout, true)?);
        }

        node.references += 1;
        if writable {
            node.writable += 1;
        }
        Ok(ChunkHandle::new(index, writable))
    }

    pub fn release(&self, handle: &mut ChunkHandle) -> Result<()> {
        if handle.released {
            return Err(Error::internal("ChunkHandle released twice"));
        }
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(handle.index as usize)
            .ok_or_else(|| Error::internal("release of unknown chunk index"))?;

        if handle.writable {
            if node.writable == 1 {
                // Last writable reference: queue for write-back without
                // decrementing references/writable yet. The queued node
                // keeps writable == 1, references == 1 so it still reads as
                // live while the write-back is in flight; `sync_chunks`'s
                // cleanup performs the matching decrement of both counts
                // once the sync actually lands.
                if node.queued {
                    return Err(Error::internal("double-queueing a chunk for write-back"));
                }
                node.time_modified = Instant::now();
                node.queued = true;
                drop(nodes);
                self.write_back.lock().push_back(handle.index);
                handle.released = true;
                return Ok(());
            }
            node.references -= 1;
            node.writable -= 1;
            node.time_modified = Instant::now();
        } else {
            node.references -= 1;
            if node.references == 0 {
                if node.queued {
                    return Err(Error::internal(
                        "releasing last read-only reference while node is queued",
                    ));
                }
                if let Some(layout) = self.layouts.get(node.index as usize) {
                    self.memory_quota.deallocate(layout.piece_length);
                }
                node.chunk = None;
            }
        }
        handle.released = true;
        Ok(())
    }

    /// Runs the sync algorithm described for `sync_chunks`; returns the
    /// number of nodes that failed to sync this round.
    pub fn sync_chunks(&self, flags: SyncFlags) -> usize {
        let candidates: Vec<u32> = {
            let queue = self.write_back.lock();
            let nodes = self.nodes.lock();
            queue
                .iter()
                .copied()
                .filter(|&idx| {
                    flags.contains(SyncFlags::ALL)
                        || nodes[idx as usize].writable <= 1
                })
                .collect()
        };

        if candidates.is_empty() {
            return 0;
        }

        if flags.contains(SyncFlags::USE_TIMEOUT) {
            let nodes = self.nodes.lock();
            let stale = candidates
                .iter()
                .any(|&idx| nodes[idx as usize].time_modified.elapsed() > self.sync_timeout);
            if !stale {
                return 0;
            }
        }

        let mut candidates = candidates;
        candidates.sort_unstable();

        let safe = flags.contains(SyncFlags::SAFE)
            || (!flags.contains(SyncFlags::SLOPPY) && self.low_on_disk_space());

        let mut failures = 0usize;
        for idx in candidates {
            let (do_sync, sync_mode_safe, cleanup) = {
                let nodes = self.nodes.lock();
                let node = &nodes[idx as usize];
                if flags.contains(SyncFlags::FORCE) {
                    (true, safe, true)
                } else if safe {
                    if node.sync_triggered {
                        (true, true, true)
                    } else {
                        (true, false, false)
                    }
                } else {
                    (true, false, true)
                }
            };

            if !do_sync {
                continue;
            }

            let sync_result = {
                let mut nodes = self.nodes.lock();
                let node = &mut nodes[idx as usize];
                let result = node
                    .chunk
                    .as_ref()
                    .map(|c| c.sync(sync_mode_safe))
                    .unwrap_or(Ok(()));
                if result.is_ok() {
                    node.sync_triggered = true;
                }
                result
            };

            match sync_result {
                Ok(()) => {
                    if cleanup {
                        let mut nodes = self.nodes.lock();
                        let node = &mut nodes[idx as usize];
                        // The single deferred decrement `release` skipped
                        // when it queued this node: one writable unit and
                        // the reference that came with it.
                        node.writable -= 1;
                        node.references -= 1;
                        node.sync_triggered = false;
                        node.queued = false;
                        if node.references == 0 {
                            if let Some(layout) = self.layouts.get(node.index as usize) {
                                self.memory_quota.deallocate(layout.piece_length);
                            }
                            node.chunk = None;
                        }
                        self.write_back.lock().retain(|&i| i != idx);
                    }
                }
                Err(e) => {
                    tracing::warn!(index = idx, error = %e, "msync failed, keeping queued");
                    failures += 1;
                }
            }
        }

        failures
    }

    pub fn write_back_len(&self) -> usize {
        self.write_back.lock().len()
    }

    /// Runs `f` against the mapped chunk behind `handle`. Used by the hash
    /// verification path, which only needs to read spans out of the chunk
    /// and never needs to hold the node lock past the callback.
    pub fn with_chunk<T>(&self, handle: &ChunkHandle, f: impl FnOnce(&Chunk) -> T) -> Result<T> {
        let nodes = self.nodes.lock();
        let node = nodes
            .get(handle.index as usize)
            .ok_or_else(|| Error::internal("with_chunk on unknown chunk index"))?;
        let chunk = node
            .chunk
            .as_ref()
            .ok_or_else(|| Error::internal("chunk handle refers to an unmapped chunk"))?;
        Ok(f(chunk))
    }

    fn low_on_disk_space(&self) -> bool {
        self.memory_quota.safe_free_diskspace() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQuota;
    use crate::storage::InMemoryStorage;

    fn make_list(n: u32) -> ChunkList {
        let mut list = ChunkList::new(Box::new(InMemoryStorage::new()), MemoryQuota::unlimited());
        let layouts = (0..n)
            .map(|i| PieceLayout {
                index: i,
                piece_length: 16384,
                segments: vec![(0, (i as u64) * 16384, 16384)],
            })
            .collect();
        list.resize(layouts).unwrap();
        list
    }

    #[test]
    fn test_get_release_readonly_drops_chunk() {
        let list = make_list(1);
        let mut h = list.get(0, false).unwrap();
        list.release(&mut h).unwrap();
        assert_eq!(list.write_back_len(), 0);
    }

    #[test]
    fn test_writable_release_enqueues_for_sync() {
        let list = make_list(1);
        let mut h = list.get(0, true).unwrap();
        list.release(&mut h).unwrap();
        assert_eq!(list.write_back_len(), 1);
    }

    #[test]
    fn test_force_safe_sync_drains_queue() {
        let list = make_list(3);
        let mut handles = vec![];
        for i in 0..3 {
            handles.push(list.get(i, true).unwrap());
        }
        for mut h in handles {
            list.release(&mut h).unwrap();
        }
        assert_eq!(list.write_back_len(), 3);
        let failures = list.sync_chunks(SyncFlags::FORCE | SyncFlags::SAFE);
        assert_eq!(failures, 0);
        assert_eq!(list.write_back_len(), 0);
    }

    #[test]
    fn test_resize_twice_fails() {
        let mut list = make_list(1);
        assert!(list.resize(vec![]).is_err());
    }

    #[test]
    fn test_releasing_an_already_released_handle_is_an_internal_error() {
        let list = make_list(1);
        let mut h1 = list.get(0, true).unwrap();
        list.release(&mut h1).unwrap();
        assert_eq!(list.write_back_len(), 1);

        // h1 is already released; releasing it again must not re-enter the
        // queueing path and corrupt the node's counts a second time.
        assert!(list.release(&mut h1).is_err());
        assert_eq!(list.write_back_len(), 1);
    }

    #[test]
    fn test_second_writer_can_release_while_node_is_queued_for_sync() {
        let list = make_list(1);
        let mut h1 = list.get(0, true).unwrap();
        list.release(&mut h1).unwrap();
        assert_eq!(list.write_back_len(), 1);

        // A second writable handle taken while the node is already queued
        // is a legitimate, separate reference; releasing it must not push
        // the node onto the write-back queue a second time.
        let mut h2 = list.get(0, true).unwrap();
        list.release(&mut h2).unwrap();
        assert_eq!(list.write_back_len(), 1);

        let failures = list.sync_chunks(SyncFlags::FORCE | SyncFlags::SAFE);
        assert_eq!(failures, 0);
        assert_eq!(list.write_back_len(), 0);
    }
}
