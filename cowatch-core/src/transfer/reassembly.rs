//! Reassembling inbound transfers
//!
//! One session per (source, media item). Chunks may arrive in any order and
//! more than once; the payload is only handed out once every sequence number
//! is present and the length matches what the sender declared.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::signaling::ChunkPayload;

/// Default cap on a single reassembled payload
pub const DEFAULT_MAX_TRANSFER_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("chunk {sequence} out of range for {total_chunks} chunks")]
    OutOfRange { sequence: u32, total_chunks: u32 },

    #[error("chunk disagrees with transfer: {0}")]
    Inconsistent(String),

    #[error("invalid chunk encoding: {0}")]
    Encoding(String),

    #[error("declared size {declared} exceeds limit {limit}")]
    TooLarge { declared: u64, limit: u64 },

    #[error("transfer {media_item_id} abandoned with {received}/{total} chunks")]
    Abandoned {
        media_item_id: String,
        received: u32,
        total: u32,
    },

    #[error("only the host can share media")]
    NotHost,

    #[error("{0} is already flowing over a direct link")]
    DirectMediaActive(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub source_id: String,
    pub media_item_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Stored, more to come
    Pending { received: u32, total: u32 },
    /// Already had this sequence
    Duplicate,
    Complete(Vec<u8>),
}

#[derive(Debug)]
struct TransferSession {
    total_chunks: u32,
    total_size: Option<u64>,
    received: BTreeMap<u32, Vec<u8>>,
    bytes: u64,
    last_activity: Instant,
}

impl TransferSession {
    fn check(&self, chunk: &ChunkPayload) -> Result<(), TransferError> {
        if chunk.total_chunks != self.total_chunks {
            return Err(TransferError::Inconsistent(format!(
                "total chunks {} != {}",
                chunk.total_chunks, self.total_chunks
            )));
        }
        if chunk.total_size.is_some() && chunk.total_size != self.total_size {
            return Err(TransferError::Inconsistent(format!(
                "total size {:?} != {:?}",
                chunk.total_size, self.total_size
            )));
        }
        Ok(())
    }

    fn assemble(self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.bytes as usize);
        for bytes in self.received.into_values() {
            payload.extend_from_slice(&bytes);
        }
        payload
    }
}

#[derive(Debug)]
pub struct Reassembler {
    sessions: HashMap<TransferKey, TransferSession>,
    max_bytes: u64,
    idle_timeout: Option<Duration>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TRANSFER_BYTES, None)
    }
}

impl Reassembler {
    pub fn new(max_bytes: u64, idle_timeout: Option<Duration>) -> Self {
        Self {
            sessions: HashMap::new(),
            max_bytes,
            idle_timeout,
        }
    }

    pub fn in_progress(&self) -> usize {
        self.sessions.len()
    }

    /// Store one chunk
    pub fn on_chunk(
        &mut self,
        source_id: &str,
        chunk: &ChunkPayload,
        now: Instant,
    ) -> Result<ChunkOutcome, TransferError> {
        if chunk.total_chunks == 0 || chunk.sequence >= chunk.total_chunks {
            return Err(TransferError::OutOfRange {
                sequence: chunk.sequence,
                total_chunks: chunk.total_chunks,
            });
        }
        if let Some(declared) = chunk.total_size {
            if declared > self.max_bytes {
                return Err(TransferError::TooLarge {
                    declared,
                    limit: self.max_bytes,
                });
            }
        }
        let bytes = STANDARD
            .decode(&chunk.bytes_base64)
            .map_err(|e| TransferError::Encoding(e.to_string()))?;

        let key = TransferKey {
            source_id: source_id.to_string(),
            media_item_id: chunk.media_item_id.clone(),
        };
        let session = self.sessions.entry(key.clone()).or_insert_with(|| {
            debug!("New inbound transfer {} from {}", chunk.media_item_id, source_id);
            TransferSession {
                total_chunks: chunk.total_chunks,
                total_size: chunk.total_size,
                received: BTreeMap::new(),
                bytes: 0,
                last_activity: now,
            }
        });
        session.check(chunk)?;
        session.last_activity = now;

        if session.received.contains_key(&chunk.sequence) {
            return Ok(ChunkOutcome::Duplicate);
        }
        session.bytes += bytes.len() as u64;
        if session.bytes > self.max_bytes {
            let session = self.sessions.remove(&key);
            let received = session.map_or(0, |s| s.received.len() as u32);
            warn!("Transfer {} exceeded {} bytes", key.media_item_id, self.max_bytes);
            return Err(TransferError::Abandoned {
                media_item_id: key.media_item_id,
                received,
                total: chunk.total_chunks,
            });
        }
        session.received.insert(chunk.sequence, bytes);

        let received = session.received.len() as u32;
        if received < session.total_chunks {
            return Ok(ChunkOutcome::Pending {
                received,
                total: session.total_chunks,
            });
        }

        let Some(session) = self.sessions.remove(&key) else {
            return Ok(ChunkOutcome::Duplicate);
        };
        if let Some(declared) = session.total_size {
            if session.bytes != declared {
                warn!(
                    "Transfer {} is {} bytes, expected {}",
                    key.media_item_id, session.bytes, declared
                );
                return Err(TransferError::Abandoned {
                    media_item_id: key.media_item_id,
                    received,
                    total: session.total_chunks,
                });
            }
        }
        Ok(ChunkOutcome::Complete(session.assemble()))
    }

    /// Drop sessions idle for longer than the timeout
    pub fn sweep(&mut self, now: Instant) -> Vec<(TransferKey, TransferError)> {
        let Some(timeout) = self.idle_timeout else {
            return Vec::new();
        };
        let expired: Vec<TransferKey> = self
            .sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_activity) >= timeout)
            .map(|(k, _)| k.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| {
                let session = self.sessions.remove(&key)?;
                let error = TransferError::Abandoned {
                    media_item_id: key.media_item_id.clone(),
                    received: session.received.len() as u32,
                    total: session.total_chunks,
                };
                Some((key, error))
            })
            .collect()
    }

    /// Forget everything from one source
    pub fn abort_source(&mut self, source_id: &str) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|k, _| k.source_id != source_id);
        before - self.sessions.len()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
