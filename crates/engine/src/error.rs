//! Error taxonomy for the transfer engine. Each variant group corresponds to
//! one of the kinds in the error handling design: protocol, communication,
//! storage, resource, internal, input.

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("protocol error: {0:#}")]
    Protocol(#[source] anyhow::Error),

    #[error("protocol error: malformed message: {0:#}")]
    ProtocolMessage(#[from] peer_protocol::MessageDeserializeError),

    #[error("protocol error: piece index {index} out of range (total pieces {total})")]
    ProtocolBadPieceIndex { index: u32, total: u32 },

    #[error("protocol error: bitfield length {got} bytes, expected {expected}")]
    ProtocolBadBitfieldLen { got: usize, expected: usize },

    #[error("protocol error: request offset+length {end} exceeds chunk size {chunk_size}")]
    ProtocolBadRequestRange { end: u64, chunk_size: u64 },

    #[error("communication error: {0:#}")]
    Communication(#[source] std::io::Error),

    #[error("communication error: peer disconnected")]
    PeerDisconnected,

    #[error("communication error: no data from peer for {0:?}")]
    KeepaliveTimeout(std::time::Duration),

    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    #[error("storage error: msync failed for chunk {index}: {source:#}")]
    Sync {
        index: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("resource error: memory quota exhausted requesting {requested_bytes} bytes")]
    OutOfMemory { requested_bytes: u64 },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("input error: {0}")]
    Input(String),
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn input(msg: impl Into<String>) -> Self {
        Error::Input(msg.into())
    }

    /// Whether this error should tear down the peer connection it occurred on.
    pub fn disconnects_peer(&self) -> bool {
        !matches!(self, Error::Storage(_) | Error::Sync { .. } | Error::Input(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
