//! Engine-wide configuration, mirroring the teacher's plain `Options`-struct
//! pattern (e.g. `TorrentStateOptions`) rather than a dynamic config file
//! format: one struct, a `Default` impl, fields overridable individually by
//! the embedding application.

use std::time::Duration;

/// Tunables shared across a torrent's `DownloadMain`, `ChunkList` and
/// `ChokeQueue`s. On-disk config file parsing is out of scope; callers build
/// this directly, typically starting from `Default::default()`.
#[derive(Debug, Clone)]
pub struct TorrentEngineConfig {
    /// Default piece length used when a torrent's metainfo omits one
    /// (practically never, but keeps `Lengths` construction infallible for
    /// callers that build a layout before parsing metainfo).
    pub default_piece_length: u32,
    /// Block size requested per outstanding request; see `CHUNK_SIZE`.
    pub chunk_size: u32,
    /// Total bytes of mmap'd chunk data this engine instance may hold at
    /// once, shared across every torrent via `MemoryQuota`.
    pub memory_quota_bytes: u64,
    /// Ceiling on simultaneously connected peers for one torrent.
    pub max_peers: usize,
    /// `ChokeQueue::max_unchoked` starting value for both upload and
    /// download choke queues.
    pub max_unchoked: usize,
    /// Margin used by `Delegator::maybe_enter_aggressive`'s endgame switch.
    pub endgame_threshold: usize,
    /// How long without any peer traffic before `PeerConnection::is_stale`.
    pub keepalive_disconnect_timeout: Duration,
    /// How often to proactively send a keepalive to an idle peer.
    pub keepalive_send_interval: Duration,
    /// How long a request may sit outstanding before the peer is snubbed.
    pub stall_timeout: Duration,
}

impl Default for TorrentEngineConfig {
    fn default() -> Self {
        TorrentEngineConfig {
            default_piece_length: 256 * 1024,
            chunk_size: 16 * 1024,
            memory_quota_bytes: 256 * 1024 * 1024,
            max_peers: 50,
            max_unchoked: 4,
            endgame_threshold: 5,
            keepalive_disconnect_timeout: Duration::from_secs(240),
            keepalive_send_interval: Duration::from_secs(120),
            stall_timeout: Duration::from_secs(20),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_spec_constants() {
        let cfg = TorrentEngineConfig::default();
        assert_eq!(cfg.chunk_size, 16384);
        assert_eq!(cfg.max_unchoked, 4);
        assert_eq!(cfg.keepalive_disconnect_timeout, Duration::from_secs(240));
    }

    #[test]
    fn test_fields_overridable_individually() {
        let cfg = TorrentEngineConfig {
            max_peers: 10,
            ..Default::default()
        };
        assert_eq!(cfg.max_peers, 10);
        assert_eq!(cfg.max_unchoked, 4);
    }
}
