use crate::broker::{ConnectionState, MessageHandler};
use crate::config::BrokerConfig;
use crate::metrics::BrokerMetrics;
use crate::protocol::{Command, CommandCodec};
use crate::topic_manager::TopicManager;
use crate::{DriftError, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// How long a closing connection may spend draining queued frames
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct BrokerServer {
    config: BrokerConfig,
    handler: MessageHandler,
    // Graceful shutdown coordination
    shutdown_tx: broadcast::Sender<()>,
    shutdown_requested: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl BrokerServer {
    /// Build a server from `config`, recovering file-backed topics
    pub fn new(config: BrokerConfig) -> Result<Self> {
        config.validate().map_err(DriftError::Config)?;

        let topics = Arc::new(TopicManager::open(&config)?);
        let metrics = Arc::new(BrokerMetrics::new());
        metrics.update_topic_count(topics.len());
        if !topics.is_empty() {
            info!("Recovered {} topic(s): {:?}", topics.len(), topics.topic_names());
        }

        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            config,
            handler: MessageHandler::new(topics, metrics),
            shutdown_tx,
            shutdown_requested: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn topics(&self) -> Arc<TopicManager> {
        Arc::clone(self.handler.topics())
    }

    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        Arc::clone(self.handler.metrics())
    }

    /// Address the server is accepting on, once [`BrokerServer::serve`] has started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Initiate graceful shutdown of the server
    pub fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        self.shutdown_requested.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until [`BrokerServer::shutdown`] is
    /// called, then wait for open connections to close and flush every topic.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);

        // Subscribe before checking the flag so a concurrent shutdown is not missed
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.shutdown_requested.load(Ordering::Acquire) {
            return self.finish();
        }

        info!(
            "DriftMQ broker listening on {} ({:?} persistence)",
            addr, self.config.persistence
        );

        let flusher = self.spawn_flusher();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = Self::optimize_client_socket(&stream) {
                                warn!("Failed to optimize client socket {}: {}", peer_addr, e);
                            }

                            let metrics = self.metrics();
                            metrics.connection_opened();
                            info!(
                                "New client connected: {} (active: {})",
                                peer_addr,
                                metrics.active_connections()
                            );

                            let handler = self.handler.clone();
                            let max_frame_size = self.config.max_frame_size;
                            let queue_size = self.config.outbound_queue_size;
                            let client_shutdown = self.shutdown_tx.subscribe();

                            connections.spawn(async move {
                                let peer = peer_addr.to_string();
                                if let Err(e) = handle_client(
                                    stream,
                                    &peer,
                                    &handler,
                                    max_frame_size,
                                    queue_size,
                                    client_shutdown,
                                )
                                .await
                                {
                                    error!("Error handling client {}: {}", peer, e);
                                } else {
                                    info!("Client {} disconnected", peer);
                                }
                                metrics.connection_closed();
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                // Reap finished connection tasks so the set does not grow
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!("Connection task failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping server gracefully...");
                    break;
                }
            }
        }

        drop(listener);
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                error!("Connection task failed: {}", e);
            }
        }
        if let Some(flusher) = flusher {
            flusher.abort();
        }

        self.finish()
    }

    fn finish(&self) -> Result<()> {
        self.handler.topics().flush_all()?;
        info!("Server shutdown complete");
        Ok(())
    }

    /// Periodically flush file-backed topics
    fn spawn_flusher(&self) -> Option<tokio::task::JoinHandle<()>> {
        let topics = self.topics();
        if !topics.is_persistent() {
            return None;
        }

        let period = self.config.flush_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let topics = Arc::clone(&topics);
                        match tokio::task::spawn_blocking(move || topics.flush_all()).await {
                            Ok(Ok(())) => debug!("Flushed topics"),
                            Ok(Err(e)) => error!("Periodic flush failed: {}", e),
                            Err(e) => error!("Flush task failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        }))
    }

    fn optimize_client_socket(stream: &TcpStream) -> Result<()> {
        use socket2::SockRef;

        let socket_ref = SockRef::from(stream);

        // Frames are small and latency sensitive
        socket_ref.set_tcp_nodelay(true)?;
        socket_ref.set_keepalive(true)?;

        Ok(())
    }
}

/// Serve one client connection over any byte stream.
///
/// The reader loop dispatches commands in arrival order while a writer task
/// drains the bounded outbound queue that replies and subscription deliveries
/// share. Returns when the peer disconnects, sends an undecodable frame, or
/// the server shuts down.
pub async fn handle_client<IO>(
    io: IO,
    peer: &str,
    handler: &MessageHandler,
    max_frame_size: usize,
    queue_size: usize,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let framed = Framed::new(io, CommandCodec::new(max_frame_size));
    let (mut sink, mut stream) = framed.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Command>(queue_size);

    let metrics = Arc::clone(handler.metrics());
    let writer_peer = peer.to_string();
    let writer = tokio::spawn(async move {
        while let Some(command) = outbound_rx.recv().await {
            // Batch whatever is already queued into one flush
            let mut batch = vec![command];
            while let Ok(next) = outbound_rx.try_recv() {
                batch.push(next);
            }

            for command in batch {
                if let Command::Data { payload, .. } = &command {
                    metrics.message_delivered(payload.len() as u64);
                }
                if let Err(e) = sink.feed(command).await {
                    warn!("Failed to write to {}: {}", writer_peer, e);
                    return;
                }
                metrics.frame_sent();
            }
            if let Err(e) = sink.flush().await {
                warn!("Failed to flush to {}: {}", writer_peer, e);
                return;
            }
        }
        let _ = sink.close().await;
    });

    let mut conn = ConnectionState::new(peer, outbound_tx);
    let result = loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(command)) => {
                    if let Err(e) = handler.handle_command(&mut conn, command).await {
                        break Err(e);
                    }
                }
                Some(Err(e)) => {
                    handler.metrics().protocol_error();
                    warn!("Failed to decode frame from {}: {}", peer, e);
                    break Err(e.into());
                }
                None => break Ok(()),
            },
            _ = shutdown_rx.recv() => {
                debug!("Closing connection {} for shutdown", peer);
                break Ok(());
            }
        }
    };

    handler.close_connection(&mut conn);
    // Dropping the last sender lets the writer drain and exit
    drop(conn);

    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        warn!("Writer for {} did not drain in time", peer);
        abort.abort();
    }

    result
}
