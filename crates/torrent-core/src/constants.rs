/// The block size used for piece requests and writes. The wire protocol caps
/// requested block length at 2^17 bytes; in practice every client (including
/// this one) requests in 16 KiB blocks.
pub const CHUNK_SIZE: u32 = 16384;
