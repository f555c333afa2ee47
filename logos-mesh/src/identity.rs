//! Human-readable identifiers for rooms and participants.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::protocol::{ParticipantId, RoomId};

const ADJECTIVES: &[&str] = &[
    "cool", "swift", "smart", "bold", "brave", "calm", "eager", "fair", "kind", "lively", "proud",
    "quick", "sharp", "wise", "zesty",
];

const ANIMALS: &[&str] = &[
    "fox", "wolf", "bear", "hawk", "deer", "owl", "puma", "seal", "lion", "tiger", "eagle",
    "duck", "frog", "lynx", "mole",
];

const ROOM_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ROOM_ID_LEN: usize = 5;

/// Adjective + animal + three-digit number, e.g. `boldlynx321`.
///
/// Ids never contain `-`, so they can be recovered from a peer address.
pub fn generate_participant_id() -> ParticipantId {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("cool");
    let animal = ANIMALS.choose(&mut rng).copied().unwrap_or("fox");
    let number: u16 = rng.gen_range(100..1000);
    ParticipantId::new(format!("{adjective}{animal}{number}"))
}

/// Five random characters from `[a-z0-9]`.
pub fn generate_room_id() -> RoomId {
    let mut rng = rand::thread_rng();
    let id: String = (0..ROOM_ID_LEN)
        .map(|_| ROOM_ALPHABET[rng.gen_range(0..ROOM_ALPHABET.len())] as char)
        .collect();
    RoomId::new(id)
}
