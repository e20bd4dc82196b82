//! Chunked Transfer Engine
//!
//! Best-effort fallback for moving media through the relay when no direct
//! link carries it: no acknowledgements, no retransmission.

mod chunker;
mod reassembly;
mod sender;

pub use chunker::{new_media_item_id, split, DEFAULT_CHUNK_SIZE};
pub use reassembly::{
    ChunkOutcome, Reassembler, TransferError, TransferKey, DEFAULT_MAX_TRANSFER_BYTES,
};
pub use sender::{begin_send, OutboundTransfer, SendPlan, TransferReport};
