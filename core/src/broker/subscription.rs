use super::topic::Topic;
use crate::protocol::{Command, Message, Offset};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

/// A live reader of one topic delivering into a connection's outbound queue.
///
/// The delivery task owns the read position. It advances only after a `DATA`
/// command has been accepted by the sink, so a closed connection never skips
/// a message. Dropping the subscription shuts it down.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: Arc<Topic>,
    start_offset: Offset,
    shared: Arc<DeliveryState>,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct DeliveryState {
    /// Signalled by the topic on every publish
    wake: Arc<Notify>,
    /// Signalled once on shutdown
    stop: Notify,
    stopped: AtomicBool,
    last_offset: AtomicU64,
}

impl Subscription {
    pub(crate) fn start(topic: Arc<Topic>, start_offset: Offset, sink: mpsc::Sender<Command>) -> Self {
        let shared = Arc::new(DeliveryState {
            wake: Arc::new(Notify::new()),
            stop: Notify::new(),
            stopped: AtomicBool::new(false),
            last_offset: AtomicU64::new(start_offset),
        });

        // Register before the task runs so no publish can slip between the
        // first offset check and the first wait
        let id = topic.register(Arc::clone(&shared.wake));
        let task = tokio::spawn(deliver(Arc::clone(&topic), Arc::clone(&shared), sink));

        debug!(
            "Subscription {} on '{}' starting at offset {}",
            id,
            topic.name(),
            start_offset
        );

        Self {
            id,
            topic,
            start_offset,
            shared,
            task,
        }
    }

    pub fn topic(&self) -> &Arc<Topic> {
        &self.topic
    }

    pub fn start_offset(&self) -> Offset {
        self.start_offset
    }

    /// Offset of the last message handed to the sink
    pub fn last_offset(&self) -> Offset {
        self.shared.last_offset.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop delivering. Does not wait for a send already in progress.
    pub fn shutdown(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.topic.unregister(self.id);
        self.shared.stop.notify_one();
        debug!("Subscription {} on '{}' shut down", self.id, self.topic.name());
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn deliver(topic: Arc<Topic>, shared: Arc<DeliveryState>, sink: mpsc::Sender<Command>) {
    let mut last = shared.last_offset.load(Ordering::Acquire);

    loop {
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }

        if last >= topic.offset() {
            tokio::select! {
                biased;
                _ = shared.stop.notified() => break,
                _ = shared.wake.notified() => continue,
            }
        }

        let (payload, end) = match topic.lookup(last) {
            Ok(Some(record)) => record,
            Ok(None) => {
                // Nothing starts before the published end yet; wait for more
                tokio::select! {
                    biased;
                    _ = shared.stop.notified() => break,
                    _ = shared.wake.notified() => continue,
                }
            }
            Err(e) => {
                error!(
                    "Subscription on '{}' stopped: failed to read offset {}: {}",
                    topic.name(),
                    last,
                    e
                );
                break;
            }
        };

        let command = Command::data(Message::new(topic.name(), payload, end));

        tokio::select! {
            biased;
            _ = shared.stop.notified() => break,
            sent = sink.send(command) => {
                if sent.is_err() {
                    debug!("Subscription sink for '{}' closed", topic.name());
                    break;
                }
            }
        }

        trace!("Delivered '{}' offset {}", topic.name(), end);
        last = end;
        shared.last_offset.store(last, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::CommitLog;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    fn topic() -> Arc<Topic> {
        Arc::new(Topic::new("foo".to_string(), CommitLog::in_memory(64)))
    }

    async fn recv_data(rx: &mut mpsc::Receiver<Command>) -> (Bytes, Offset) {
        match timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(Command::Data { payload, offset, .. })) => (payload, offset),
            other => panic!("expected DATA, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delivers_complete_data_command() {
        let topic = topic();
        topic.publish(b"payload").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let _sub = topic.subscribe_from(0, tx);

        let command = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(
            command,
            Some(Command::Data {
                topic: "foo".to_string(),
                offset: 11,
                payload: Bytes::from_static(b"payload"),
            })
        );
    }

    #[tokio::test]
    async fn test_subscribe_from_zero_replays_then_follows() {
        let topic = topic();
        topic.publish(b"foo").unwrap();
        topic.publish(b"bar").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let sub = topic.subscribe_from(0, tx);

        topic.publish(b"baz").unwrap();
        topic.publish(b"car").unwrap();

        let mut received = Vec::new();
        for _ in 0..4 {
            received.push(recv_data(&mut rx).await);
        }
        assert_eq!(
            received,
            vec![
                (Bytes::from_static(b"foo"), 7),
                (Bytes::from_static(b"bar"), 14),
                (Bytes::from_static(b"baz"), 21),
                (Bytes::from_static(b"car"), 28),
            ]
        );

        assert_eq!(sub.start_offset(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_latest_skips_history() {
        let topic = topic();
        topic.publish(b"old").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let _sub = topic.subscribe(tx);
        topic.publish(b"new").unwrap();

        assert_eq!(recv_data(&mut rx).await, (Bytes::from_static(b"new"), 14));
    }

    #[tokio::test]
    async fn test_offset_past_end_is_clamped() {
        let topic = topic();
        topic.publish(b"old").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let sub = topic.subscribe_from(500, tx);
        assert_eq!(sub.start_offset(), 7);

        topic.publish(b"new").unwrap();
        assert_eq!(recv_data(&mut rx).await, (Bytes::from_static(b"new"), 14));
    }

    #[tokio::test]
    async fn test_shutdown_stops_delivery() {
        let topic = topic();
        let (tx, mut rx) = mpsc::channel(16);
        let sub = topic.subscribe(tx);
        assert_eq!(topic.subscriber_count(), 1);

        sub.shutdown();
        assert_eq!(topic.subscriber_count(), 0);
        topic.publish(b"ignored").unwrap();

        // The task drops its sender when it exits
        assert_eq!(timeout(Duration::from_secs(5), rx.recv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_closed_sink_does_not_advance() {
        let topic = topic();
        let (tx, rx) = mpsc::channel(16);
        let sub = topic.subscribe_from(0, tx);
        drop(rx);

        topic.publish(b"lost").unwrap();
        timeout(Duration::from_secs(5), async {
            while !sub.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sub.last_offset(), 0);
    }

    #[tokio::test]
    async fn test_slow_consumer_does_not_block_publisher() {
        let topic = topic();
        let (tx, mut rx) = mpsc::channel(1);
        let _sub = topic.subscribe_from(0, tx);

        for i in 0..100u32 {
            topic.publish(&i.to_be_bytes()).unwrap();
        }

        for i in 0..100u32 {
            let (payload, _) = recv_data(&mut rx).await;
            assert_eq!(&payload[..], &i.to_be_bytes());
        }
    }
}
