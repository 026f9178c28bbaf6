//! DownloadMain (C8): per-torrent orchestrator. Wires together the
//! ChunkList, Delegator, upload/download ChokeQueues and the connection
//! list, and drives the endgame switch and peer-acquisition policy. The
//! tracker and handshake subsystems are consumed only through the narrow
//! collaborator interfaces named below — this crate implements neither.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::choke::ChokeQueue;
use crate::chunk_list::ChunkList;
use crate::delegator::Delegator;
use crate::peer_connection::PeerConnection;
use crate::block::PeerHandle;

/// `send_start`/`send_stop` report torrent lifecycle to the tracker;
/// `request_current`/`request_next` ask for more peers. Event delivery
/// (the peer-address lists the tracker streams back) is left to the
/// caller's transport; DownloadMain only calls out when it wants more
/// peers, per the spec's "ask the same tracker again" policy.
pub trait Tracker: Send + Sync {
    fn send_start(&self);
    fn send_stop(&self);
    fn request_current(&self) -> Vec<SocketAddr>;
    fn request_next(&self) -> Vec<SocketAddr>;
}

/// Handshake subsystem: DownloadMain hands it addresses to dial or file
/// descriptors to accept and gets a `PeerHandle` back once a handshake
/// completes. The actual socket/async IO lives entirely on the other side
/// of this interface.
pub trait HandshakeManager: Send + Sync {
    fn add_outgoing(&self, addr: SocketAddr, info_hash: [u8; 20]);
}

pub struct DownloadMainConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub max_pending_handshakes: usize,
    /// Ask the tracker again once connections have grown by less than this
    /// amount since the last request.
    pub tracker_growth_threshold: usize,
}

impl Default for DownloadMainConfig {
    fn default() -> Self {
        DownloadMainConfig {
            min_connections: 4,
            max_connections: 50,
            max_pending_handshakes: 10,
            tracker_growth_threshold: 10,
        }
    }
}

pub struct DownloadMain {
    pub chunks: Arc<ChunkList>,
    pub delegator: Delegator,
    pub upload_choke: ChokeQueue,
    pub download_choke: ChokeQueue,

    connections: HashMap<PeerHandle, PeerConnection>,
    available: VecDeque<SocketAddr>,
    connected_addrs: HashSet<SocketAddr>,
    pending_handshakes: HashSet<SocketAddr>,

    config: DownloadMainConfig,
    connections_at_last_tracker_request: usize,

    stopped: bool,
}

impl DownloadMain {
    pub fn new(
        chunks: Arc<ChunkList>,
        delegator: Delegator,
        upload_choke: ChokeQueue,
        download_choke: ChokeQueue,
        config: DownloadMainConfig,
    ) -> Self {
        DownloadMain {
            chunks,
            delegator,
            upload_choke,
            download_choke,
            connections: HashMap::new(),
            available: VecDeque::new(),
            connected_addrs: HashSet::new(),
            pending_handshakes: HashSet::new(),
            config,
            connections_at_last_tracker_request: 0,
            stopped: false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn add_available(&mut self, addr: SocketAddr) {
        if !self.connected_addrs.contains(&addr) {
            self.available.push_back(addr);
        }
    }

    pub fn insert_connection(&mut self, peer: PeerHandle, addr: SocketAddr, conn: PeerConnection) {
        self.connected_addrs.insert(addr);
        self.pending_handshakes.remove(&addr);
        self.connections.insert(peer, conn);
    }

    pub fn connection(&self, peer: PeerHandle) -> Option<&PeerConnection> {
        self.connections.get(&peer)
    }

    pub fn connection_mut(&mut self, peer: PeerHandle) -> Option<&mut PeerConnection> {
        self.connections.get_mut(&peer)
    }

    /// Asks the delegator for more blocks to request from `peer` until its
    /// queued-plus-outstanding count reaches `pipe`, per §4.4's
    /// `|outstanding_requests(P)| <= pipe_size(rate(P))`. The delegated
    /// blocks are only queued here; `PeerConnection::next_write_action`
    /// is what actually turns them into outgoing REQUESTs and moves them
    /// into `outstanding`.
    pub fn fill_requests(&mut self, peer: PeerHandle, pipe: usize) {
        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        if conn.peer_choking || !conn.am_interested {
            return;
        }
        while conn.queued_request_count() + conn.outstanding.len() < pipe {
            let has_piece = |index: usize| conn.has_piece(index);
            match self.delegator.delegate(peer, has_piece) {
                Some(req) => conn.queue_request(req),
                None => break,
            }
        }
    }

    pub fn drop_connection(&mut self, peer: PeerHandle, addr: SocketAddr) {
        self.connections.remove(&peer);
        self.connected_addrs.remove(&addr);
        self.upload_choke.disconnected(peer);
        self.download_choke.disconnected(peer);
        for piece_index in self
            .delegator
            .transfer_list()
            .piece_indices()
            .collect::<Vec<_>>()
        {
            if let Some(list) = self.delegator.transfer_list_mut().get_mut(piece_index) {
                for block in &mut list.blocks {
                    block.erase_peer(peer);
                }
            }
        }
    }

    /// Endgame switch per spec §4.7: `chunks_completed + pieces_in_transfer
    /// + 5 >= total_chunks`.
    pub fn maybe_enter_endgame(&mut self, chunks_completed: u32) {
        let pieces_in_transfer = self.delegator.transfer_list().len() as u32;
        self.delegator
            .maybe_enter_aggressive(chunks_completed, pieces_in_transfer);
    }

    /// Pops addresses from the available list and initiates handshakes
    /// while below the connection targets.
    pub fn receive_connect_peers(&mut self, info_hash: [u8; 20], handshakes: &dyn HandshakeManager) {
        while self.connections.len() < self.config.min_connections
            && self.connections.len() + self.pending_handshakes.len()
                < self.config.max_connections
            && self.pending_handshakes.len() < self.config.max_pending_handshakes
        {
            let Some(addr) = self.pop_random_available() else {
                break;
            };
            self.pending_handshakes.insert(addr);
            handshakes.add_outgoing(addr, info_hash);
        }
    }

    fn pop_random_available(&mut self) -> Option<SocketAddr> {
        while let Some(addr) = self.available.pop_front() {
            if !self.connected_addrs.contains(&addr) && !self.pending_handshakes.contains(&addr) {
                return Some(addr);
            }
        }
        None
    }

    /// Whether a tracker request should be made now: connections haven't
    /// grown by the configured threshold since the last request.
    pub fn should_request_tracker(&self) -> bool {
        self.connections.len()
            < self.connections_at_last_tracker_request + self.config.tracker_growth_threshold
    }

    pub fn request_peers_from_tracker(&mut self, tracker: &dyn Tracker) {
        let addrs = if self.connections_at_last_tracker_request == 0 {
            tracker.request_current()
        } else {
            tracker.request_next()
        };
        for addr in addrs {
            self.add_available(addr);
        }
        self.connections_at_last_tracker_request = self.connections.len();
    }

    /// Drains the connection list and cancels all outstanding transfers.
    /// Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for (_, mut conn) in self.connections.drain() {
            conn.outstanding.cancel();
        }
        self.available.clear();
        self.connected_addrs.clear();
        self.pending_handshakes.clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryQuota;
    use crate::piece_tracker::{Bitfield, PieceTracker};
    use crate::storage::InMemoryStorage;
    use torrent_core::lengths::Lengths;

    struct NoopHandshakes;
    impl HandshakeManager for NoopHandshakes {
        fn add_outgoing(&self, _addr: SocketAddr, _info_hash: [u8; 20]) {}
    }

    fn make_download_main(min: usize, max: usize) -> DownloadMain {
        let lengths = Lengths::new(16384, 16384).unwrap();
        let needed = Bitfield::repeat(true, lengths.total_pieces() as usize);
        let tracker = PieceTracker::new(lengths, needed);
        let delegator = Delegator::new(tracker);
        let chunks = Arc::new(ChunkList::new(
            Box::new(InMemoryStorage::new()),
            MemoryQuota::unlimited(),
        ));
        let upload_choke = ChokeQueue::new(4, 1000, 8, Box::new(|_| 0), Box::new(|_| 0));
        let download_choke = ChokeQueue::new(4, 1000, 8, Box::new(|_| 0), Box::new(|_| 0));
        let config = DownloadMainConfig {
            min_connections: min,
            max_connections: max,
            max_pending_handshakes: max,
            tracker_growth_threshold: 10,
        };
        DownloadMain::new(chunks, delegator, upload_choke, download_choke, config)
    }

    #[test]
    fn test_receive_connect_peers_respects_min() {
        let mut dm = make_download_main(2, 10);
        dm.add_available("127.0.0.1:1000".parse().unwrap());
        dm.add_available("127.0.0.1:1001".parse().unwrap());
        dm.add_available("127.0.0.1:1002".parse().unwrap());
        dm.receive_connect_peers([0u8; 20], &NoopHandshakes);
        assert_eq!(dm.pending_handshakes.len(), 2);
    }

    #[test]
    fn test_stop_is_idempotent_and_drains() {
        let mut dm = make_download_main(1, 10);
        dm.insert_connection(
            PeerHandle(1),
            "127.0.0.1:2000".parse().unwrap(),
            PeerConnection::new(1, 5),
        );
        dm.stop();
        assert_eq!(dm.connection_count(), 0);
        dm.stop();
        assert!(dm.is_stopped());
    }

    #[test]
    fn test_fill_requests_delegates_and_queues_on_connection() {
        use peer_protocol::Frame;

        let mut dm = make_download_main(1, 10);
        let peer = PeerHandle(1);
        let mut conn = PeerConnection::new(1, 5);
        conn.on_frame(Frame::Unchoke, std::time::Instant::now())
            .unwrap();
        conn.on_frame(Frame::Have(0), std::time::Instant::now())
            .unwrap();
        conn.set_am_interested(true);
        dm.insert_connection(peer, "127.0.0.1:3000".parse().unwrap(), conn);

        dm.fill_requests(peer, 2);
        let conn = dm.connection(peer).unwrap();
        assert_eq!(conn.queued_request_count(), 1);

        // A second fill doesn't double-delegate the same single-block piece.
        dm.fill_requests(peer, 2);
        assert_eq!(dm.connection(peer).unwrap().queued_request_count(), 1);
    }

    #[test]
    fn test_fill_requests_skips_uninterested_or_choking_peers() {
        let mut dm = make_download_main(1, 10);
        let peer = PeerHandle(1);
        dm.insert_connection(
            peer,
            "127.0.0.1:3001".parse().unwrap(),
            PeerConnection::new(1, 5),
        );
        dm.fill_requests(peer, 2);
        assert_eq!(dm.connection(peer).unwrap().queued_request_count(), 0);
    }

    #[test]
    fn test_should_request_tracker_threshold() {
        let dm = make_download_main(1, 10);
        assert!(dm.should_request_tracker());
    }
}
