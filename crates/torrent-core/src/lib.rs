pub mod constants;
pub mod error;
pub mod id20;
pub mod lengths;
pub mod peer_id;
pub mod torrent_metainfo;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
