use rand::RngCore;

use crate::id20::Id20;

/// Generates a fresh Azureus-style peer id: `-XX0001-` followed by 12 random
/// bytes, as sent in the handshake.
pub fn generate_peer_id() -> Id20 {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(b"-TE0001-");
    rand::thread_rng().fill_bytes(&mut peer_id[8..]);
    Id20(peer_id)
}
