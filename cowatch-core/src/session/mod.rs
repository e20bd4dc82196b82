//! Room Session
//!
//! Ties the relay link, the sync engine, the peer manager and the transfer
//! engine together for one joined room. Everything runs on a single actor
//! task; the UI talks to it through a [`RoomSession`] handle and observes it
//! through [`SessionEvent`](crate::events::SessionEvent)s.

mod actor;
mod handle;

#[cfg(test)]
mod tests;

pub use handle::{JoinRequest, RoomSession};
