use rand::Rng;

const ROOM_ID_LEN: usize = 7;
const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate an opaque 7-character base-36 room id (~36 bits).
///
/// Collision resolution is out of scope; the space is large enough that two
/// concurrently minted rooms colliding is vanishingly rare.
pub fn generate_room_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_ID_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
