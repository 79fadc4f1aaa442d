//! Reconnecting publish/subscribe session
//!
//! A [`Session`] owns one logical connection to a broker. All socket work
//! happens on a background event loop; the handle only touches the shared
//! attachment set and publish window and nudges the loop through a command
//! queue.
//!
//! Whenever a new connection comes up the loop first re-issues every
//! attachment, then resends every unacknowledged publish in sequence order.
//! Each publish goes out exactly once per connection: the loop remembers the
//! first sequence number it has not yet written to the current transport.

use crate::attachment::{AttachmentSet, AttachmentState, MessageHandler};
use crate::config::{SessionOptions, SubscribeOptions};
use crate::connection::{BoxedStream, ConnectionState, Transport, TransportEvent};
use crate::error::{check_topic, ClientError};
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::window::SlidingWindow;
use crate::Result;
use bytes::Bytes;
use driftmq::protocol::timestamp_millis;
use driftmq::{Command, Message, Offset, SeqNum};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::pending;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, warn};

struct Shared {
    attachments: AttachmentSet,
    window: SlidingWindow,
    metrics: ClientMetrics,
}

enum Op {
    PublishReady,
    Attach(String),
    Detach(String),
    Close(oneshot::Sender<()>),
}

/// Completion handle for one publish
#[derive(Debug)]
pub struct PendingAck {
    seq: SeqNum,
    rx: oneshot::Receiver<SeqNum>,
}

impl PendingAck {
    pub fn seq(&self) -> SeqNum {
        self.seq
    }

    /// Wait until the broker has stored the message
    pub async fn wait(self) -> Result<SeqNum> {
        self.rx.await.map_err(|_| ClientError::Closed)
    }
}

/// Handle to a reconnecting broker session
pub struct Session {
    shared: Arc<Shared>,
    ops: mpsc::UnboundedSender<Op>,
    state: watch::Receiver<ConnectionState>,
    task: Mutex<Option<JoinHandle<()>>>,
    max_frame_size: usize,
}

impl Session {
    /// Start a session against `addr`. Connecting happens in the background,
    /// so this returns immediately; publishes and subscriptions made before
    /// the first connection are sent once it is up.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(addr: impl Into<String>, options: SessionOptions) -> Result<Self> {
        options.validate()?;
        let addr = addr.into();

        let shared = Arc::new(Shared {
            attachments: AttachmentSet::new(),
            window: SlidingWindow::new(options.window_size),
            metrics: ClientMetrics::new(),
        });
        let (ops, ops_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let max_frame_size = options.max_frame_size;

        let event_loop = EventLoop {
            addr,
            options,
            shared: Arc::clone(&shared),
            state_tx,
            events_tx,
            transport: None,
            generation: 0,
            attempt: 0,
            pings_out: 0,
            next_unsent: 0,
            ping: None,
            backoff: None,
            dialing: None,
        };
        let task = tokio::spawn(event_loop.run(ops_rx, events_rx));

        Ok(Self {
            shared,
            ops,
            state,
            task: Mutex::new(Some(task)),
            max_frame_size,
        })
    }

    /// Queue a message for `topic`. Waits while the publish window is full.
    /// The returned handle resolves once the broker acknowledges it.
    ///
    /// Messages whose PUBLISH frame would exceed the configured frame limit
    /// are rejected here and never enter the window.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> Result<PendingAck> {
        check_topic(topic)?;
        let payload = payload.into();
        let len = payload.len();

        let size = Command::Publish {
            topic: topic.to_string(),
            seq: 0,
            payload: payload.clone(),
        }
        .payload_len();
        if size > self.max_frame_size {
            return Err(ClientError::MessageTooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        let (message, rx) = self.shared.window.push(topic.to_string(), payload).await?;
        self.shared.metrics.record_publish(len);
        self.ops
            .send(Op::PublishReady)
            .map_err(|_| ClientError::Closed)?;

        Ok(PendingAck {
            seq: message.seq,
            rx,
        })
    }

    /// Attach to `topic` starting at its current end
    pub fn subscribe<F>(&self, topic: &str, on_message: F) -> Result<()>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.subscribe_with(topic, SubscribeOptions::default(), on_message)
    }

    pub fn subscribe_with<F>(
        &self,
        topic: &str,
        options: SubscribeOptions,
        on_message: F,
    ) -> Result<()>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        check_topic(topic)?;
        if self.shared.window.is_closed() {
            return Err(ClientError::Closed);
        }
        let handler: MessageHandler = Arc::new(on_message);
        self.shared
            .attachments
            .add(topic, options.from_offset, handler, options.on_attached)?;
        self.ops
            .send(Op::Attach(topic.to_string()))
            .map_err(|_| ClientError::Closed)
    }

    /// Stop delivery for `topic`. The attachment is forgotten once the
    /// broker confirms with DETACHED.
    pub fn detach(&self, topic: &str) -> Result<()> {
        self.shared.attachments.detach(topic)?;
        self.ops
            .send(Op::Detach(topic.to_string()))
            .map_err(|_| ClientError::Closed)
    }

    /// Stop reconnecting, drop the connection and fail every pending
    /// acknowledgement with [`ClientError::Closed`].
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.ops.send(Op::Close(tx)).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::Closed)
    }

    pub fn attachment_state(&self, topic: &str) -> Option<AttachmentState> {
        self.shared.attachments.state(topic)
    }

    /// Last offset delivered on `topic`, usable to resume elsewhere
    pub fn attachment_offset(&self, topic: &str) -> Option<Offset> {
        self.shared.attachments.offset(topic)
    }

    /// Publishes not yet acknowledged
    pub fn unacked(&self) -> usize {
        self.shared.window.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }
}

struct EventLoop {
    addr: String,
    options: SessionOptions,
    shared: Arc<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    transport: Option<Transport>,
    /// Incremented for every established connection, starting at 1
    generation: u64,
    attempt: u32,
    pings_out: u32,
    /// Lowest sequence number not yet written to the current transport
    next_unsent: SeqNum,
    ping: Option<Interval>,
    backoff: Option<Pin<Box<Sleep>>>,
    dialing: Option<BoxFuture<'static, io::Result<BoxedStream>>>,
}

impl EventLoop {
    async fn run(
        mut self,
        mut ops: mpsc::UnboundedReceiver<Op>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        self.schedule_connect();

        loop {
            tokio::select! {
                op = ops.recv() => match op {
                    Some(Op::Close(done)) => {
                        self.shutdown();
                        let _ = done.send(());
                        return;
                    }
                    Some(op) => self.handle_op(op),
                    None => {
                        debug!("Session handle dropped");
                        self.shutdown();
                        return;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
                _ = backoff_elapsed(&mut self.backoff) => {
                    self.backoff = None;
                    self.start_dial();
                }
                result = dial_finished(&mut self.dialing) => {
                    self.dialing = None;
                    self.on_dial_result(result);
                }
                _ = ping_due(&mut self.ping) => self.on_ping_tick(),
            }
        }
    }

    fn handle_op(&mut self, op: Op) {
        let Some(transport) = &self.transport else {
            // Everything is replayed when the next connection comes up
            return;
        };
        match op {
            Op::PublishReady => {
                for message in self.shared.window.messages_from(self.next_unsent) {
                    self.next_unsent = message.seq + 1;
                    transport.send(message.to_command());
                }
            }
            Op::Attach(topic) => {
                if let Some(command) = self.shared.attachments.attach_command(&topic, self.generation) {
                    transport.send(command);
                }
            }
            Op::Detach(topic) => {
                if let Some(command) = self.shared.attachments.detach_command(&topic, self.generation) {
                    transport.send(command);
                }
            }
            Op::Close(_) => {}
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        let current = match &self.transport {
            Some(transport) => transport.generation(),
            None => return,
        };
        match event {
            TransportEvent::Frame {
                generation,
                command,
            } if generation == current => self.on_frame(command),
            TransportEvent::Lost { generation, reason } if generation == current => {
                self.on_lost(&reason)
            }
            _ => debug!("Ignoring event from a previous connection"),
        }
    }

    fn on_frame(&mut self, command: Command) {
        let shared = &self.shared;
        match command {
            Command::Ack { seq } => {
                let acked = shared.window.acknowledge(seq);
                shared.metrics.record_acked(acked.len());
            }
            Command::Data {
                topic,
                offset,
                payload,
            } => {
                let len = payload.len();
                match shared.attachments.on_data(&topic, offset, payload) {
                    Some((handler, message)) => {
                        shared.metrics.record_received(len);
                        handler(message);
                    }
                    None => {
                        debug!("Dropping DATA for '{}' at offset {}", topic, offset);
                        shared.metrics.record_dropped();
                    }
                }
            }
            Command::Attached { topic, offset } => {
                debug!("Attached to '{}' at offset {}", topic, offset);
                if let Some(callback) = shared.attachments.on_attached(&topic, offset) {
                    callback(&topic, offset);
                }
            }
            Command::Detached { topic } => {
                if shared.attachments.on_detached(&topic) {
                    debug!("Detached from '{}'", topic);
                }
            }
            Command::Pong { .. } => self.pings_out = 0,
            other => debug!("Ignoring unexpected {:?} frame", other.frame_type()),
        }
    }

    fn schedule_connect(&mut self) {
        let delay = (self.options.backoff)(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        if delay.is_zero() {
            self.start_dial();
        } else {
            debug!("Reconnecting to {} in {:?}", self.addr, delay);
            self.backoff = Some(Box::pin(tokio::time::sleep(delay)));
        }
    }

    fn start_dial(&mut self) {
        self.set_state(ConnectionState::Connecting);
        let dial = self.options.dialer.dial(self.addr.clone());
        let timeout = self.options.connect_timeout;
        self.dialing = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, dial).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timed out",
                )),
            }
        }));
    }

    fn on_dial_result(&mut self, result: io::Result<BoxedStream>) {
        match result {
            Ok(stream) => self.on_connected(stream),
            Err(e) => {
                warn!(
                    "Connection attempt {} to {} failed: {}",
                    self.attempt, self.addr, e
                );
                self.shared.metrics.record_connection_failed();
                self.set_state(ConnectionState::Disconnected);
                self.schedule_connect();
            }
        }
    }

    fn on_connected(&mut self, stream: BoxedStream) {
        self.generation += 1;
        self.attempt = 0;
        let transport = Transport::spawn(
            stream,
            self.generation,
            self.options.max_frame_size,
            self.events_tx.clone(),
        );

        for command in self.shared.attachments.connection_commands(self.generation) {
            transport.send(command);
        }
        let (pending, next_seq) = self.shared.window.snapshot();
        if self.generation > 1 && !pending.is_empty() {
            info!("Resending {} unacknowledged messages", pending.len());
            self.shared.metrics.record_resent(pending.len());
        }
        for message in &pending {
            transport.send(message.to_command());
        }
        self.next_unsent = next_seq;
        self.transport = Some(transport);

        self.pings_out = 0;
        let period = self.options.ping_interval;
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ping = Some(ping);

        self.shared.metrics.record_connection_established();
        info!("Connected to {} (connection {})", self.addr, self.generation);
        self.set_state(ConnectionState::Connected);
    }

    fn on_lost(&mut self, reason: &str) {
        warn!("Connection to {} lost: {}", self.addr, reason);
        self.transport = None;
        self.ping = None;
        self.shared.metrics.record_connection_lost();
        self.set_state(ConnectionState::Disconnected);
        self.schedule_connect();
    }

    fn on_ping_tick(&mut self) {
        if self.pings_out >= self.options.max_ping_out {
            let reason = format!("{} pings unanswered", self.pings_out);
            self.on_lost(&reason);
            return;
        }
        if let Some(transport) = &self.transport {
            transport.send(Command::Ping {
                timestamp: timestamp_millis(),
            });
            self.pings_out += 1;
            self.shared.metrics.record_ping();
        }
    }

    fn shutdown(&mut self) {
        self.transport = None;
        self.ping = None;
        self.backoff = None;
        self.dialing = None;
        self.shared.window.close();
        self.set_state(ConnectionState::Disconnected);
        info!("Session to {} closed", self.addr);
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        self.state_tx.send_replace(state);
        debug!("Session state: {:?}", state);
        if let Some(callback) = &self.options.on_state_change {
            callback(state);
        }
    }
}

async fn backoff_elapsed(backoff: &mut Option<Pin<Box<Sleep>>>) {
    match backoff {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn dial_finished(
    dialing: &mut Option<BoxFuture<'static, io::Result<BoxedStream>>>,
) -> io::Result<BoxedStream> {
    match dialing {
        Some(dial) => dial.await,
        None => pending().await,
    }
}

async fn ping_due(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}
