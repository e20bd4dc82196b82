//! Cowatch - Core Library
//!
//! Host-authoritative watch parties: one participant drives playback, the
//! rest follow. Control messages and file chunks go through a WebSocket
//! relay; screen shares and voice go over direct peer links.

pub mod api;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod ffi;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod sync;
pub mod transfer;

// Re-exports for convenience
pub use config::SessionConfig;
pub use directory::{Participant, RoomDirectory, RoomId};
pub use error::SessionError;
pub use events::{EventBus, SessionEvent, Subscription};
pub use relay::{RelayHub, RelayServices};
pub use session::{JoinRequest, RoomSession};
pub use signaling::{Envelope, SignalMessage};
pub use sync::{MediaDescriptor, PlaybackState, SyncEngine};

// Setup uniffi scaffolding
uniffi::setup_scaffolding!();
