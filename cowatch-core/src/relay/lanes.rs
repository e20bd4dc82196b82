//! Priority lanes
//!
//! Every connection gets two queues: an unbounded control lane that is always
//! drained first, and a bounded bulk lane for chunk traffic that drops when
//! full.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    #[default]
    Control,
    Bulk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LaneError {
    #[error("lane closed")]
    Closed,
    #[error("bulk lane full")]
    Full,
}

/// Create a connected sender/receiver pair
pub fn lanes<T>(bulk_depth: usize) -> (LaneSender<T>, LaneReceiver<T>) {
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (bulk_tx, bulk_rx) = mpsc::channel(bulk_depth.max(1));
    (
        LaneSender {
            control: control_tx,
            bulk: bulk_tx,
        },
        LaneReceiver {
            control: control_rx,
            bulk: bulk_rx,
            control_open: true,
            bulk_open: true,
        },
    )
}

#[derive(Debug)]
pub struct LaneSender<T> {
    control: mpsc::UnboundedSender<T>,
    bulk: mpsc::Sender<T>,
}

impl<T> Clone for LaneSender<T> {
    fn clone(&self) -> Self {
        Self {
            control: self.control.clone(),
            bulk: self.bulk.clone(),
        }
    }
}

impl<T> LaneSender<T> {
    /// Queue without waiting. Bulk items are refused when the lane is full.
    pub fn send(&self, item: T, lane: Lane) -> Result<(), LaneError> {
        match lane {
            Lane::Control => self.control.send(item).map_err(|_| LaneError::Closed),
            Lane::Bulk => self.bulk.try_send(item).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => LaneError::Full,
                mpsc::error::TrySendError::Closed(_) => LaneError::Closed,
            }),
        }
    }

    /// Queue on the bulk lane, waiting for room
    pub async fn send_bulk(&self, item: T) -> Result<(), LaneError> {
        self.bulk.send(item).await.map_err(|_| LaneError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }
}

#[derive(Debug)]
pub struct LaneReceiver<T> {
    control: mpsc::UnboundedReceiver<T>,
    bulk: mpsc::Receiver<T>,
    control_open: bool,
    bulk_open: bool,
}

impl<T> LaneReceiver<T> {
    /// Next item, control first. `None` once both lanes are closed and empty.
    pub async fn recv(&mut self) -> Option<(T, Lane)> {
        loop {
            tokio::select! {
                biased;

                item = self.control.recv(), if self.control_open => match item {
                    Some(item) => return Some((item, Lane::Control)),
                    None => self.control_open = false,
                },
                item = self.bulk.recv(), if self.bulk_open => match item {
                    Some(item) => return Some((item, Lane::Bulk)),
                    None => self.bulk_open = false,
                },
                else => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_control_overtakes_bulk() {
        let (tx, mut rx) = lanes::<u32>(8);
        tx.send(1, Lane::Bulk).unwrap();
        tx.send(2, Lane::Bulk).unwrap();
        tx.send(3, Lane::Control).unwrap();

        assert_eq!(rx.recv().await, Some((3, Lane::Control)));
        assert_eq!(rx.recv().await, Some((1, Lane::Bulk)));
        assert_eq!(rx.recv().await, Some((2, Lane::Bulk)));
    }

    #[tokio::test]
    async fn test_full_bulk_lane_drops() {
        let (tx, mut rx) = lanes::<u32>(1);
        tx.send(1, Lane::Bulk).unwrap();
        assert_eq!(tx.send(2, Lane::Bulk), Err(LaneError::Full));
        // Control is never refused
        tx.send(3, Lane::Control).unwrap();

        assert_eq!(rx.recv().await, Some((3, Lane::Control)));
        assert_eq!(rx.recv().await, Some((1, Lane::Bulk)));
    }

    #[tokio::test]
    async fn test_drains_then_closes() {
        let (tx, mut rx) = lanes::<u32>(4);
        tx.send(1, Lane::Bulk).unwrap();
        drop(tx);
        assert_eq!(rx.recv().await, Some((1, Lane::Bulk)));
        assert_eq!(rx.recv().await, None);
    }
}
