use crate::{
    broker::{Subscription, Topic},
    metrics::BrokerMetrics,
    protocol::{Command, Offset, SeqNum},
    topic_manager::TopicManager,
    DriftError, Result,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace};

/// Per-connection state: the outbound queue drained by the connection's
/// writer task and the subscriptions this connection has attached.
#[derive(Debug)]
pub struct ConnectionState {
    peer: String,
    outbound: mpsc::Sender<Command>,
    subscriptions: HashMap<String, Subscription>,
}

impl ConnectionState {
    pub fn new<S: Into<String>>(peer: S, outbound: mpsc::Sender<Command>) -> Self {
        Self {
            peer: peer.into(),
            outbound,
            subscriptions: HashMap::new(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn subscription(&self, topic: &str) -> Option<&Subscription> {
        self.subscriptions.get(topic)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.outbound
            .send(command)
            .await
            .map_err(|_| DriftError::Network(format!("writer for {} closed", self.peer)))
    }
}

/// Dispatches decoded commands against the topic registry.
///
/// Shared by every connection; all per-connection state lives in
/// [`ConnectionState`].
#[derive(Debug, Clone)]
pub struct MessageHandler {
    topics: Arc<TopicManager>,
    metrics: Arc<BrokerMetrics>,
}

impl MessageHandler {
    pub fn new(topics: Arc<TopicManager>, metrics: Arc<BrokerMetrics>) -> Self {
        Self { topics, metrics }
    }

    pub fn topics(&self) -> &Arc<TopicManager> {
        &self.topics
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.metrics
    }

    /// Handle one command from the client.
    ///
    /// An error means the connection must be closed: the peer sent something
    /// unusable, a publish could not be stored, or the writer is gone.
    pub async fn handle_command(&self, conn: &mut ConnectionState, command: Command) -> Result<()> {
        self.metrics.frame_received();
        trace!("{} -> {:?}", conn.peer, command.frame_type());

        match command {
            Command::Attach { topic, offset } => self.handle_attach(conn, topic, offset).await,
            Command::Detach { topic } => self.handle_detach(conn, topic).await,
            Command::Publish {
                topic,
                seq,
                payload,
            } => self.handle_publish(conn, topic, seq, payload).await,
            Command::Ping { timestamp } => conn.send(Command::Pong { timestamp }).await,
            other => {
                debug!(
                    "Ignoring {:?} frame from {}: not a client command",
                    other.frame_type(),
                    conn.peer
                );
                Ok(())
            }
        }
    }

    async fn handle_attach(
        &self,
        conn: &mut ConnectionState,
        name: String,
        offset: Option<Offset>,
    ) -> Result<()> {
        let topic = self.topic(&name)?;

        if let Some(previous) = conn.subscriptions.remove(&name) {
            debug!("{} re-attaching to '{}', replacing subscription", conn.peer, name);
            previous.shutdown();
            self.metrics.subscription_closed();
        }

        // ATTACHED is queued before the subscription exists so it always
        // precedes the first DATA frame
        let start = topic.resolve_start(offset);
        conn.send(Command::Attached {
            topic: name.clone(),
            offset: start,
        })
        .await?;

        let subscription = topic.subscribe_from(start, conn.outbound.clone());
        self.metrics.subscription_opened();
        info!(
            "{} attached to '{}' at offset {} (requested {:?})",
            conn.peer, name, start, offset
        );
        conn.subscriptions.insert(name, subscription);
        Ok(())
    }

    async fn handle_detach(&self, conn: &mut ConnectionState, name: String) -> Result<()> {
        match conn.subscriptions.remove(&name) {
            Some(subscription) => {
                subscription.shutdown();
                self.metrics.subscription_closed();
                info!("{} detached from '{}'", conn.peer, name);
            }
            None => debug!("{} detached from '{}' without a subscription", conn.peer, name),
        }
        conn.send(Command::Detached { topic: name }).await
    }

    async fn handle_publish(
        &self,
        conn: &ConnectionState,
        name: String,
        seq: SeqNum,
        payload: Bytes,
    ) -> Result<()> {
        let topic = self.topic(&name)?;

        // A failed publish is never acknowledged, and the connection closes so
        // no later cumulative ACK can cover it
        let offset = topic.publish(&payload).map_err(|e| {
            self.metrics.storage_error();
            error!("Failed to store publish seq {} on '{}': {}", seq, name, e);
            DriftError::from(e)
        })?;
        self.metrics.message_published(payload.len() as u64);

        trace!("Stored seq {} from {} on '{}' at {}", seq, conn.peer, name, offset);
        conn.send(Command::Ack { seq }).await
    }

    fn topic(&self, name: &str) -> Result<Arc<Topic>> {
        if let Some(topic) = self.topics.get(name) {
            return Ok(topic);
        }
        let topic = self.topics.get_or_create(name)?;
        self.metrics.update_topic_count(self.topics.len());
        Ok(topic)
    }

    /// Shut down every subscription the connection still holds
    pub fn close_connection(&self, conn: &mut ConnectionState) {
        for (name, subscription) in conn.subscriptions.drain() {
            subscription.shutdown();
            self.metrics.subscription_closed();
            debug!("Closed subscription to '{}' for {}", name, conn.peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn handler() -> MessageHandler {
        MessageHandler::new(
            Arc::new(TopicManager::in_memory(1024)),
            Arc::new(BrokerMetrics::new()),
        )
    }

    fn connection() -> (ConnectionState, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(64);
        (ConnectionState::new("test-peer", tx), rx)
    }

    async fn next(rx: &mut mpsc::Receiver<Command>) -> Command {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for outbound command")
            .expect("outbound queue closed")
    }

    fn publish(topic: &str, seq: SeqNum, payload: &'static [u8]) -> Command {
        Command::Publish {
            topic: topic.to_string(),
            seq,
            payload: Bytes::from_static(payload),
        }
    }

    #[tokio::test]
    async fn test_publish_is_acked() {
        let handler = handler();
        let (mut conn, mut rx) = connection();

        handler.handle_command(&mut conn, publish("foo", 0, b"A")).await.unwrap();
        handler.handle_command(&mut conn, publish("foo", 1, b"B")).await.unwrap();

        assert_eq!(next(&mut rx).await, Command::Ack { seq: 0 });
        assert_eq!(next(&mut rx).await, Command::Ack { seq: 1 });
        assert_eq!(handler.topics().get("foo").unwrap().offset(), 10);
        assert_eq!(handler.metrics().messages_published(), 2);
    }

    #[tokio::test]
    async fn test_failed_store_is_not_acked() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::BrokerConfig::default().with_data_dir(dir.path());
        let handler = MessageHandler::new(
            Arc::new(TopicManager::open(&config).unwrap()),
            Arc::new(BrokerMetrics::new()),
        );
        let (mut conn, mut rx) = connection();

        // The topic exists but its directory can no longer hold segments
        handler.topics().get_or_create("foo").unwrap();
        let topic_dir = dir.path().join("foo");
        std::fs::remove_dir_all(&topic_dir).unwrap();
        std::fs::write(&topic_dir, b"not a directory").unwrap();

        let err = handler
            .handle_command(&mut conn, publish("foo", 0, b"A"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriftError::Storage(_)));
        assert!(rx.try_recv().is_err());
        assert_eq!(handler.topics().get("foo").unwrap().offset(), 0);

        let metrics = handler.metrics().snapshot();
        assert_eq!(metrics.storage_errors, 1);
        assert_eq!(metrics.messages_published, 0);
    }

    #[tokio::test]
    async fn test_attached_precedes_data() {
        let handler = handler();
        let (mut conn, mut rx) = connection();
        handler.handle_command(&mut conn, publish("foo", 0, b"foo")).await.unwrap();
        handler.handle_command(&mut conn, publish("foo", 1, b"bar")).await.unwrap();
        assert_eq!(next(&mut rx).await, Command::Ack { seq: 0 });
        assert_eq!(next(&mut rx).await, Command::Ack { seq: 1 });

        handler
            .handle_command(
                &mut conn,
                Command::Attach {
                    topic: "foo".to_string(),
                    offset: Some(0),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            next(&mut rx).await,
            Command::Attached {
                topic: "foo".to_string(),
                offset: 0
            }
        );
        assert_eq!(
            next(&mut rx).await,
            Command::Data {
                topic: "foo".to_string(),
                offset: 7,
                payload: Bytes::from_static(b"foo"),
            }
        );
        assert_eq!(
            next(&mut rx).await,
            Command::Data {
                topic: "foo".to_string(),
                offset: 14,
                payload: Bytes::from_static(b"bar"),
            }
        );
    }

    #[tokio::test]
    async fn test_attach_latest_reports_end_offset() {
        let handler = handler();
        let (mut conn, mut rx) = connection();
        handler.handle_command(&mut conn, publish("foo", 0, b"foo")).await.unwrap();
        assert_eq!(next(&mut rx).await, Command::Ack { seq: 0 });

        handler
            .handle_command(
                &mut conn,
                Command::Attach {
                    topic: "foo".to_string(),
                    offset: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            next(&mut rx).await,
            Command::Attached {
                topic: "foo".to_string(),
                offset: 7
            }
        );
        assert_eq!(conn.subscription("foo").unwrap().start_offset(), 7);
    }

    #[tokio::test]
    async fn test_reattach_replaces_subscription() {
        let handler = handler();
        let (mut conn, mut rx) = connection();
        let attach = Command::Attach {
            topic: "foo".to_string(),
            offset: None,
        };

        handler.handle_command(&mut conn, attach.clone()).await.unwrap();
        handler.handle_command(&mut conn, attach).await.unwrap();
        next(&mut rx).await;
        next(&mut rx).await;

        assert_eq!(conn.subscription_count(), 1);
        assert_eq!(handler.topics().get("foo").unwrap().subscriber_count(), 1);
        assert_eq!(handler.metrics().active_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_detach_replies_even_without_subscription() {
        let handler = handler();
        let (mut conn, mut rx) = connection();
        let detach = Command::Detach {
            topic: "foo".to_string(),
        };

        handler.handle_command(&mut conn, detach).await.unwrap();
        assert_eq!(
            next(&mut rx).await,
            Command::Detached {
                topic: "foo".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_detach_stops_subscription() {
        let handler = handler();
        let (mut conn, mut rx) = connection();
        handler
            .handle_command(
                &mut conn,
                Command::Attach {
                    topic: "foo".to_string(),
                    offset: None,
                },
            )
            .await
            .unwrap();
        next(&mut rx).await;

        handler
            .handle_command(
                &mut conn,
                Command::Detach {
                    topic: "foo".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(next(&mut rx).await, Command::Detached { .. }));
        assert_eq!(conn.subscription_count(), 0);
        assert_eq!(handler.topics().get("foo").unwrap().subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_gets_matching_pong() {
        let handler = handler();
        let (mut conn, mut rx) = connection();
        handler
            .handle_command(&mut conn, Command::Ping { timestamp: 1234 })
            .await
            .unwrap();
        assert_eq!(next(&mut rx).await, Command::Pong { timestamp: 1234 });
    }

    #[tokio::test]
    async fn test_client_only_commands_are_ignored() {
        let handler = handler();
        let (mut conn, mut rx) = connection();
        handler
            .handle_command(&mut conn, Command::Ack { seq: 5 })
            .await
            .unwrap();
        handler
            .handle_command(&mut conn, Command::Ping { timestamp: 1 })
            .await
            .unwrap();
        assert_eq!(next(&mut rx).await, Command::Pong { timestamp: 1 });
    }

    #[tokio::test]
    async fn test_invalid_topic_closes_connection() {
        let handler = handler();
        let (mut conn, _rx) = connection();
        let err = handler
            .handle_command(&mut conn, publish("../etc", 0, b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DriftError::InvalidTopic { .. }));
        assert!(handler.topics().is_empty());
    }

    #[tokio::test]
    async fn test_close_connection_shuts_down_subscriptions() {
        let handler = handler();
        let (mut conn, mut rx) = connection();
        for name in ["a", "b"] {
            handler
                .handle_command(
                    &mut conn,
                    Command::Attach {
                        topic: name.to_string(),
                        offset: None,
                    },
                )
                .await
                .unwrap();
            next(&mut rx).await;
        }

        handler.close_connection(&mut conn);
        assert_eq!(conn.subscription_count(), 0);
        assert_eq!(handler.metrics().active_subscriptions(), 0);
        assert_eq!(handler.topics().get("a").unwrap().subscriber_count(), 0);
    }
}
