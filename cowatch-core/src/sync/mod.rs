//! Sync Engine
//!
//! Handles synchronization of playback state between the host and followers.

mod clock;
mod protocol;
mod state;

pub use clock::*;
pub use protocol::*;
pub use state::*;
