use rand::RngCore;
use uuid::Uuid;

/// `nbytes` random bytes, lowercase hex encoded.
pub fn token_hex(nbytes: usize) -> String {
    let mut buf = vec![0u8; nbytes];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn new_user_id() -> Uuid {
    Uuid::new_v4()
}
