//! Splitting payloads into chunks

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::signaling::ChunkPayload;

/// Default chunk size in bytes, before base64
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Split `payload` into `ceil(len / chunk_size)` chunks. An empty payload
/// still produces one (empty) chunk so the receiver sees a completed transfer.
pub fn split(media_item_id: &str, payload: &[u8], chunk_size: usize) -> Vec<ChunkPayload> {
    let chunk_size = chunk_size.max(1);
    let total_size = payload.len() as u64;

    let pieces: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(chunk_size).collect()
    };
    let total_chunks = pieces.len() as u32;

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, bytes)| ChunkPayload {
            media_item_id: media_item_id.to_string(),
            sequence: i as u32,
            total_chunks,
            total_size: Some(total_size),
            bytes_base64: STANDARD.encode(bytes),
        })
        .collect()
}

/// Random id for an outbound transfer
pub fn new_media_item_id() -> String {
    use rand::Rng;
    format!("media-{:016x}", rand::thread_rng().gen::<u64>())
}
