//! Signaling
//!
//! Control messages between participants and their JSON envelope.

mod codec;
mod message;

pub use codec::{decode, encode, DecodeError, EncodeError};
pub use message::*;
