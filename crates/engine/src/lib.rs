//! Peer-to-peer file transfer engine: chunk storage and verification,
//! block-level transfer reconciliation, per-peer protocol state, the
//! unchoke allocator, and the per-torrent orchestrator that wires all of it
//! together.

pub mod block;
pub mod choke;
pub mod chunk;
pub mod chunk_list;
pub mod config;
pub mod delegator;
pub mod download_main;
pub mod error;
pub mod hash_queue;
pub mod memory;
pub mod peer_connection;
pub mod piece_tracker;
pub mod request_list;
pub mod scheduler;
pub mod storage;

pub use block::{Block, BlockList, BlockProgress, PeerHandle, TransferList, TransferState};
pub use choke::ChokeQueue;
pub use chunk::{Chunk, ChunkPart};
pub use chunk_list::{ChunkHandle, ChunkList, SyncFlags};
pub use config::TorrentEngineConfig;
pub use delegator::Delegator;
pub use download_main::{DownloadMain, DownloadMainConfig, HandshakeManager, Tracker};
pub use error::{Error, Result};
pub use hash_queue::{HashOutcome, HashQueue, HashTorrent};
pub use memory::MemoryQuota;
pub use peer_connection::{pipe_size, PeerConnection, PeerEvent, RequestContext, WriteAction};
pub use piece_tracker::{Bitfield, ChunkMarkingResult, PieceTracker};
pub use request_list::{PieceRequest, RequestList};
pub use storage::{ChunkFactory, FilesystemStorage, InMemoryStorage, PieceLayout, TorrentStorage};
