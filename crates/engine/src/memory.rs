//! ChunkMemoryManager collaborator: a cooperative memory quota shared by all
//! chunks a torrent (or a whole session) may have mapped at once.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Inner {
    limit: u64,
    used: AtomicU64,
    free_diskspace: AtomicU64,
}

/// A cooperative allocation counter, not an atomic reservation: `allocate`
/// races harmlessly against concurrent callers the way the single-threaded
/// reactor model assumes, since torrents don't contend within themselves;
/// cross-torrent contention is the one place this matters and the atomic
/// counter keeps that safe.
#[derive(Clone)]
pub struct MemoryQuota(Arc<Inner>);

impl MemoryQuota {
    pub fn new(limit_bytes: u64) -> Self {
        MemoryQuota(Arc::new(Inner {
            limit: limit_bytes,
            used: AtomicU64::new(0),
            free_diskspace: AtomicU64::new(u64::MAX),
        }))
    }

    pub fn unlimited() -> Self {
        Self::new(u64::MAX)
    }

    pub fn allocate(&self, bytes: u64) -> bool {
        let mut current = self.0.used.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(bytes) {
                Some(n) if n <= self.0.limit => n,
                _ => return false,
            };
            match self.0.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn deallocate(&self, bytes: u64) {
        self.0.used.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn used(&self) -> u64 {
        self.0.used.load(Ordering::Relaxed)
    }

    pub fn set_free_diskspace(&self, bytes: u64) {
        self.0.free_diskspace.store(bytes, Ordering::Relaxed);
    }

    pub fn safe_free_diskspace(&self) -> u64 {
        self.0.free_diskspace.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_respects_limit() {
        let q = MemoryQuota::new(100);
        assert!(q.allocate(60));
        assert!(!q.allocate(50));
        assert!(q.allocate(40));
    }

    #[test]
    fn test_deallocate_frees_room() {
        let q = MemoryQuota::new(100);
        assert!(q.allocate(100));
        assert!(!q.allocate(1));
        q.deallocate(50);
        assert!(q.allocate(50));
    }
}
