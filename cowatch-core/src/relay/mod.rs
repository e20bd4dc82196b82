//! Transport Relay
//!
//! Room-scoped message relay. The hub fans frames out to room members on two
//! priority lanes; `serve_member` runs one connection; `RelayLink` is the
//! client end.

mod frame;
mod hub;
mod lanes;
mod link;
mod serve;

pub use frame::{ClientFrame, RelayError, RelayErrorKind, ServerFrame};
pub use hub::{ConnectionId, HubStats, MemberSender, RelayHub, RelayObserver};
pub use lanes::{lanes, Lane, LaneError, LaneReceiver, LaneSender};
pub use link::{connect, RelayLink, RelaySender};
pub use serve::{serve_member, RelayServices, DEFAULT_RECONNECT_GRACE};
