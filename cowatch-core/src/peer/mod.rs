//! Direct peer links
//!
//! Negotiation bookkeeping for media and voice links. The actual media stack
//! sits behind [`MediaBackend`].

mod backend;
mod link;
mod manager;

pub use backend::*;
pub use link::{LinkState, PeerLink};
pub use manager::{PeerError, PeerManager, PeerOutput, DEFAULT_FAILURE_WINDOW};
