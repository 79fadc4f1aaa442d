//! Connection management for the DriftMQ client
//!
//! A [`Dialer`] produces byte streams; a [`Transport`] wraps one stream with
//! a reader task and a writer task. Transports never reconnect themselves.
//! They report frames and failures to the session, tagged with the
//! connection generation they belong to, and the session decides what to do.

use driftmq::protocol::CommandCodec;
use driftmq::Command;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

/// Session connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Any bidirectional byte stream a session can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens a new stream to the broker. Called once per connection attempt.
pub trait Dialer: Send + Sync + 'static {
    fn dial(&self, addr: String) -> BoxFuture<'static, io::Result<BoxedStream>>;
}

impl<F, Fut> Dialer for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = io::Result<BoxedStream>> + Send + 'static,
{
    fn dial(&self, addr: String) -> BoxFuture<'static, io::Result<BoxedStream>> {
        Box::pin(self(addr))
    }
}

/// Plain TCP with Nagle disabled
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, addr: String) -> BoxFuture<'static, io::Result<BoxedStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            debug!("Connected to {}", addr);
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// What a transport reports back to the session
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Frame { generation: u64, command: Command },
    Lost { generation: u64, reason: String },
}

/// Reader and writer tasks for one live connection
pub(crate) struct Transport {
    generation: u64,
    outbound: mpsc::UnboundedSender<Command>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Transport {
    pub(crate) fn spawn(
        stream: BoxedStream,
        generation: u64,
        max_frame_size: usize,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Command>();

        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, CommandCodec::new(max_frame_size));
            let reason = loop {
                match frames.next().await {
                    Some(Ok(command)) => {
                        if reader_events
                            .send(TransportEvent::Frame {
                                generation,
                                command,
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Dropping connection after decode error: {}", e);
                        break e.to_string();
                    }
                    None => break "connection closed by broker".to_string(),
                }
            };
            let _ = reader_events.send(TransportEvent::Lost { generation, reason });
        });

        let writer = tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, CommandCodec::new(max_frame_size));
            while let Some(command) = outbound_rx.recv().await {
                let mut result = sink.feed(command).await;
                while result.is_ok() {
                    match outbound_rx.try_recv() {
                        Ok(next) => result = sink.feed(next).await,
                        Err(_) => break,
                    }
                }
                if result.is_ok() {
                    result = sink.flush().await;
                }
                if let Err(e) = result {
                    let _ = events.send(TransportEvent::Lost {
                        generation,
                        reason: e.to_string(),
                    });
                    return;
                }
            }
        });

        Self {
            generation,
            outbound,
            reader,
            writer,
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a frame. A failed send means the writer is gone and a
    /// `Lost` event is already on its way.
    pub(crate) fn send(&self, command: Command) {
        if self.outbound.send(command).is_err() {
            debug!("Writer for connection {} already stopped", self.generation);
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio_util::codec::Framed;

    #[tokio::test]
    async fn test_transport_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let transport = Transport::spawn(Box::new(client), 3, 1024, events_tx);

        let mut broker = Framed::new(server, CommandCodec::new(1024));
        transport.send(Command::Publish {
            topic: "t".to_string(),
            seq: 0,
            payload: Bytes::from_static(b"x"),
        });
        assert!(matches!(
            broker.next().await,
            Some(Ok(Command::Publish { seq: 0, .. }))
        ));

        broker.send(Command::Ack { seq: 0 }).await.unwrap();
        match events.recv().await {
            Some(TransportEvent::Frame {
                generation: 3,
                command: Command::Ack { seq: 0 },
            }) => {}
            other => panic!("unexpected event {:?}", other),
        }

        drop(broker);
        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Lost { generation: 3, .. })
        ));
    }
}
