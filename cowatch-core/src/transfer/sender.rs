//! Paced outbound transfers
//!
//! Each transfer runs in its own task and queues chunks on the bulk lane with
//! a fixed delay between them, so control traffic is never stuck behind it.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::chunker::split;
use crate::relay::{ClientFrame, Lane, RelaySender};
use crate::signaling::{encode, Envelope, SignalMessage};

/// Where and how to send
#[derive(Debug, Clone)]
pub struct SendPlan {
    pub room_id: String,
    pub from: String,
    /// `None` sends to the whole room
    pub to: Option<String>,
    pub chunk_size: usize,
    pub pace: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub media_item_id: String,
    pub sent: u32,
    pub total: u32,
    pub cancelled: bool,
}

/// Handle to a running transfer. Dropping it cancels the transfer.
#[derive(Debug)]
pub struct OutboundTransfer {
    media_item_id: String,
    cancel: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<TransferReport>>,
}

impl OutboundTransfer {
    pub fn media_item_id(&self) -> &str {
        &self.media_item_id
    }

    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the task to end
    pub async fn finish(mut self) -> Option<TransferReport> {
        let handle = self.handle.take()?;
        handle.await.ok()
    }
}

/// Start streaming `payload` as chunk envelopes
pub fn begin_send(
    sender: RelaySender,
    plan: SendPlan,
    media_item_id: String,
    payload: Vec<u8>,
) -> OutboundTransfer {
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    let id = media_item_id.clone();

    let handle = tokio::spawn(async move {
        let chunks = split(&media_item_id, &payload, plan.chunk_size);
        drop(payload);
        let total = chunks.len() as u32;
        info!("Sending {} as {} chunks", media_item_id, total);

        let mut pace = tokio::time::interval(plan.pace.max(Duration::from_millis(1)));
        pace.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut sent = 0;
        let mut cancelled = false;
        for chunk in chunks {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    break;
                }
                _ = pace.tick() => {}
            }

            let envelope = Envelope::new(
                plan.room_id.clone(),
                plan.from.clone(),
                plan.to.clone(),
                SignalMessage::Chunk(chunk),
            );
            let text = match encode(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode chunk: {}", e);
                    break;
                }
            };
            let frame = ClientFrame::Signal {
                to: plan.to.clone(),
                lane: Lane::Bulk,
                envelope: text,
            };

            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    break;
                }
                result = sender.send_bulk(frame) => {
                    if result.is_err() {
                        debug!("Relay closed during transfer of {}", media_item_id);
                        break;
                    }
                }
            }
            sent += 1;
        }

        if cancelled {
            info!("Transfer {} cancelled after {}/{} chunks", media_item_id, sent, total);
        } else {
            debug!("Transfer {} queued {}/{} chunks", media_item_id, sent, total);
        }
        TransferReport {
            media_item_id,
            sent,
            total,
            cancelled,
        }
    });

    OutboundTransfer {
        media_item_id: id,
        cancel: Some(cancel_tx),
        handle: Some(handle),
    }
}

impl Drop for OutboundTransfer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::lanes;
    use crate::signaling::decode;

    fn plan(chunk_size: usize, pace_ms: u64) -> SendPlan {
        SendPlan {
            room_id: "ROOM".into(),
            from: "alice".into(),
            to: None,
            chunk_size,
            pace: Duration::from_millis(pace_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_go_out_on_bulk_lane() {
        let (tx, mut rx) = lanes::<ClientFrame>(8);
        let transfer = begin_send(tx, plan(4, 20), "m1".into(), vec![9; 10]);

        let mut sequences = Vec::new();
        for _ in 0..3 {
            let (frame, lane) = rx.recv().await.unwrap();
            assert_eq!(lane, Lane::Bulk);
            let ClientFrame::Signal { envelope, .. } = frame else {
                panic!("expected signal frame");
            };
            match decode(&envelope).unwrap().message {
                SignalMessage::Chunk(c) => sequences.push(c.sequence),
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_eq!(sequences, vec![0, 1, 2]);

        let report = transfer.finish().await.unwrap();
        assert_eq!(report.sent, 3);
        assert!(!report.cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_sending() {
        let (tx, mut rx) = lanes::<ClientFrame>(8);
        let mut transfer = begin_send(tx, plan(1, 1_000), "m1".into(), vec![0; 100]);
        rx.recv().await.unwrap();

        transfer.cancel();
        let report = transfer.finish().await.unwrap();
        assert!(report.cancelled);
        assert!(report.sent < 100);
    }
}
