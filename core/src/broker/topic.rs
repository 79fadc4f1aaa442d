use super::subscription::Subscription;
use crate::protocol::{Command, Offset};
use crate::storage::{CommitLog, StorageResult};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::trace;

/// A named stream of messages backed by its own commit log.
///
/// Publishing appends to the log and wakes every live subscription; it never
/// waits on consumers. Each subscription reads the log at its own pace.
#[derive(Debug)]
pub struct Topic {
    name: String,
    log: CommitLog,
    state: Mutex<TopicState>,
    next_subscription_id: AtomicU64,
}

#[derive(Debug)]
struct TopicState {
    /// Highest end offset published so far
    offset: Offset,
    /// Wake handles of live subscriptions
    subscribers: HashMap<u64, Arc<Notify>>,
}

impl Topic {
    pub fn new(name: String, log: CommitLog) -> Self {
        let offset = log.end_offset();
        Self {
            name,
            log,
            state: Mutex::new(TopicState {
                offset,
                subscribers: HashMap::new(),
            }),
            next_subscription_id: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log(&self) -> &CommitLog {
        &self.log
    }

    /// End offset of the newest published message
    pub fn offset(&self) -> Offset {
        self.state.lock().offset
    }

    /// Append a message and wake subscribers. Returns the message offset.
    pub fn publish(&self, payload: &[u8]) -> StorageResult<Offset> {
        let end = self.log.append(payload)?;

        let waiters: Vec<Arc<Notify>> = {
            let mut state = self.state.lock();
            // Concurrent publishers may finish out of order
            state.offset = state.offset.max(end);
            state.subscribers.values().cloned().collect()
        };
        for waiter in waiters {
            waiter.notify_one();
        }

        trace!("Published {} bytes to '{}' at {}", payload.len(), self.name, end);
        Ok(end)
    }

    /// Read the first message starting at or after `offset`
    pub fn lookup(&self, offset: Offset) -> StorageResult<Option<(Bytes, Offset)>> {
        self.log.lookup(offset)
    }

    /// Where a subscription asking for `offset` actually starts: requests past
    /// the end are clamped to the end
    pub fn resolve_start(&self, offset: Option<Offset>) -> Offset {
        let end = self.offset();
        offset.map_or(end, |offset| offset.min(end))
    }

    /// Subscribe to messages published from now on
    pub fn subscribe(self: &Arc<Self>, sink: mpsc::Sender<Command>) -> Subscription {
        let start = self.offset();
        self.subscribe_from(start, sink)
    }

    /// Subscribe starting at `offset`, replaying everything already stored
    /// after it
    pub fn subscribe_from(self: &Arc<Self>, offset: Offset, sink: mpsc::Sender<Command>) -> Subscription {
        let start = self.resolve_start(Some(offset));
        Subscription::start(Arc::clone(self), start, sink)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.log.flush()
    }

    pub(crate) fn register(&self, wake: Arc<Notify>) -> u64 {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        self.state.lock().subscribers.insert(id, wake);
        id
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.state.lock().subscribers.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic() -> Arc<Topic> {
        Arc::new(Topic::new("foo".to_string(), CommitLog::in_memory(1024)))
    }

    #[test]
    fn test_publish_advances_offset() {
        let topic = topic();
        assert_eq!(topic.offset(), 0);
        assert_eq!(topic.publish(b"foo").unwrap(), 7);
        assert_eq!(topic.publish(b"bar").unwrap(), 14);
        assert_eq!(topic.offset(), 14);
        assert_eq!(topic.lookup(7).unwrap(), Some((Bytes::from_static(b"bar"), 14)));
    }

    #[test]
    fn test_resolve_start_clamps_to_end() {
        let topic = topic();
        topic.publish(b"foo").unwrap();

        assert_eq!(topic.resolve_start(None), 7);
        assert_eq!(topic.resolve_start(Some(0)), 0);
        assert_eq!(topic.resolve_start(Some(3)), 3);
        assert_eq!(topic.resolve_start(Some(1_000)), 7);
    }

    #[test]
    fn test_offset_starts_at_recovered_end() {
        let log = CommitLog::in_memory(1024);
        log.append(b"already there").unwrap();
        let topic = Topic::new("t".to_string(), log);
        assert_eq!(topic.offset(), 17);
    }

    #[tokio::test]
    async fn test_publish_wakes_registered_subscribers() {
        let topic = topic();
        let wake = Arc::new(Notify::new());
        let id = topic.register(Arc::clone(&wake));
        assert_eq!(topic.subscriber_count(), 1);

        topic.publish(b"x").unwrap();
        // The stored permit makes the next wait complete immediately
        let woken = tokio::time::timeout(std::time::Duration::from_millis(10), wake.notified())
            .await
            .is_ok();
        assert!(woken);

        topic.unregister(id);
        assert_eq!(topic.subscriber_count(), 0);
    }
}
