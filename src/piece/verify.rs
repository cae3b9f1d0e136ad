use sha1::{Digest, Sha1};

pub fn piece_hash(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Checks assembled piece data against the 20 byte SHA-1 from the metainfo.
///
/// Runs on a blocking thread in the driver; never call it from the event loop
/// for full size pieces.
pub fn verify_piece(data: &[u8], expected_hash: &[u8; 20]) -> bool {
    piece_hash(data) == *expected_hash
}
