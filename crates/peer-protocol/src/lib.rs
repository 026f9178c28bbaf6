pub mod framer;
pub mod handshake;
pub mod messages;

pub use framer::{Frame, PieceDisposition, ProtocolReader};
pub use handshake::Handshake;
pub use messages::{
    Message, MessageDeserializeError, MsgIdDebug, Piece, Request, SerializeError,
};
