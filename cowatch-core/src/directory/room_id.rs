//! Room Identifiers
//!
//! Human-friendly room ids that can be read out loud or typed on a TV remote.

use std::fmt;
use std::str::FromStr;

/// Unambiguous uppercase characters (no 0/O, 1/I/L, 5/S, 2/Z)
const ALPHABET: &[u8] = b"346789ABCDEFGHJKMNPQRTUVWXY";

const ID_LENGTH: usize = 8;

/// A room id in canonical form (8 characters, no separator)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid room id: {0:?}")]
pub struct InvalidRoomId(pub String);

impl RoomId {
    /// Generate a random room id
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let id = (0..ID_LENGTH)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        RoomId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse user input, ignoring case, spaces and dashes
    pub fn parse(input: &str) -> Result<Self, InvalidRoomId> {
        let normalized: String = input
            .chars()
            .filter(|c| c.is_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.len() == ID_LENGTH && normalized.bytes().all(|b| ALPHABET.contains(&b)) {
            Ok(RoomId(normalized))
        } else {
            Err(InvalidRoomId(input.to_string()))
        }
    }
}

impl FromStr for RoomId {
    type Err = InvalidRoomId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RoomId::parse(s)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", &self.0[..4], &self.0[4..])
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}
