//! Bounded window of unacknowledged publishes
//!
//! Every publish takes the next sequence number and stays in the window until
//! the broker acknowledges it. Acknowledgements are cumulative: `ACK(k)`
//! completes every entry with `seq <= k`, oldest first. When the window is
//! full, [`SlidingWindow::push`] waits for room instead of dropping or
//! failing, which is what pushes back on fast producers.

use crate::error::ClientError;
use crate::Result;
use bytes::Bytes;
use driftmq::{Command, SeqNum};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::{oneshot, Notify};

/// A publish that has been assigned a sequence number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPublish {
    pub topic: String,
    pub seq: SeqNum,
    pub payload: Bytes,
}

impl QueuedPublish {
    pub fn to_command(&self) -> Command {
        Command::Publish {
            topic: self.topic.clone(),
            seq: self.seq,
            payload: self.payload.clone(),
        }
    }
}

struct Pending {
    message: QueuedPublish,
    ack: oneshot::Sender<SeqNum>,
}

struct WindowState {
    pending: VecDeque<Pending>,
    next_seq: SeqNum,
    closed: bool,
}

pub struct SlidingWindow {
    capacity: usize,
    state: Mutex<WindowState>,
    space: Notify,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(WindowState {
                pending: VecDeque::with_capacity(capacity),
                next_seq: 0,
                closed: false,
            }),
            space: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Assign the next sequence number, waiting while the window is full.
    ///
    /// The returned receiver resolves once the entry is acknowledged. It is
    /// dropped without a value if the window closes first.
    pub async fn push(
        &self,
        topic: String,
        payload: Bytes,
    ) -> Result<(QueuedPublish, oneshot::Receiver<SeqNum>)> {
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(ClientError::Closed);
                }
                if state.pending.len() < self.capacity {
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    let (ack, rx) = oneshot::channel();
                    let message = QueuedPublish {
                        topic,
                        seq,
                        payload,
                    };
                    state.pending.push_back(Pending {
                        message: message.clone(),
                        ack,
                    });
                    return Ok((message, rx));
                }
            }

            notified.await;
        }
    }

    /// Complete every entry with `seq <= up_to`, returning the completed
    /// sequence numbers in ascending order.
    pub fn acknowledge(&self, up_to: SeqNum) -> Vec<SeqNum> {
        let completed: Vec<Pending> = {
            let mut state = self.state.lock();
            let count = state
                .pending
                .iter()
                .take_while(|p| p.message.seq <= up_to)
                .count();
            state.pending.drain(..count).collect()
        };

        if completed.is_empty() {
            return Vec::new();
        }
        self.space.notify_waiters();

        completed
            .into_iter()
            .map(|p| {
                let seq = p.message.seq;
                // The publisher may have stopped waiting
                let _ = p.ack.send(seq);
                seq
            })
            .collect()
    }

    /// All unacknowledged entries, oldest first
    pub fn messages(&self) -> Vec<QueuedPublish> {
        self.messages_from(0)
    }

    /// Unacknowledged entries with `seq >= from`, oldest first
    pub fn messages_from(&self, from: SeqNum) -> Vec<QueuedPublish> {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|p| p.message.seq >= from)
            .map(|p| p.message.clone())
            .collect()
    }

    /// Unacknowledged entries plus the sequence number the next push will
    /// get, read under one lock.
    pub fn snapshot(&self) -> (Vec<QueuedPublish>, SeqNum) {
        let state = self.state.lock();
        let messages = state.pending.iter().map(|p| p.message.clone()).collect();
        (messages, state.next_seq)
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail all outstanding entries and reject further pushes
    pub fn close(&self) {
        let dropped: Vec<Pending> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.drain(..).collect()
        };
        drop(dropped);
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    async fn push(window: &SlidingWindow, payload: &'static str) -> (SeqNum, oneshot::Receiver<SeqNum>) {
        let (message, rx) = window
            .push("t".to_string(), Bytes::from_static(payload.as_bytes()))
            .await
            .unwrap();
        (message.seq, rx)
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase() {
        let window = SlidingWindow::new(8);
        for expected in 0..5 {
            let (seq, _rx) = push(&window, "x").await;
            assert_eq!(seq, expected);
        }
        assert_eq!(window.len(), 5);
    }

    #[tokio::test]
    async fn test_cumulative_ack_completes_in_order() {
        let window = SlidingWindow::new(8);
        let mut receivers = Vec::new();
        for _ in 0..4 {
            receivers.push(push(&window, "x").await.1);
        }

        assert_eq!(window.acknowledge(2), vec![0, 1, 2]);
        for (expected, rx) in receivers.drain(..3).enumerate() {
            assert_eq!(rx.await.unwrap(), expected as SeqNum);
        }

        // Older acknowledgements are no-ops
        assert!(window.acknowledge(1).is_empty());
        assert_eq!(window.messages().len(), 1);
        assert_eq!(window.messages()[0].seq, 3);
    }

    #[tokio::test]
    async fn test_full_window_blocks_until_ack() {
        let window = Arc::new(SlidingWindow::new(2));
        push(&window, "a").await;
        push(&window, "b").await;

        let blocked = {
            let window = Arc::clone(&window);
            tokio::spawn(async move { push(&window, "c").await.0 })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        window.acknowledge(0);
        let seq = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seq, 2);
        assert_eq!(window.len(), 2);
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_blocked() {
        let window = Arc::new(SlidingWindow::new(1));
        let (_, rx) = push(&window, "a").await;

        let blocked = {
            let window = Arc::clone(&window);
            tokio::spawn(async move {
                window
                    .push("t".to_string(), Bytes::from_static(b"b"))
                    .await
                    .map(|_| ())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        window.close();
        assert!(rx.await.is_err());
        assert!(matches!(blocked.await.unwrap(), Err(ClientError::Closed)));
        assert!(window.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_and_messages_from() {
        let window = SlidingWindow::new(8);
        for _ in 0..3 {
            push(&window, "x").await;
        }
        window.acknowledge(0);

        let (messages, next) = window.snapshot();
        assert_eq!(messages.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(next, 3);
        assert_eq!(window.messages_from(2).len(), 1);
        assert!(window.messages_from(3).is_empty());
    }
}
