//! # DriftMQ Client Library
//!
//! An async Rust client for the DriftMQ broker.
//!
//! ## Features
//!
//! - **Reconnects on its own**: dropped connections are redialed with
//!   exponential backoff and every attachment is restored
//! - **At-least-once publishing**: unacknowledged messages are resent after a
//!   reconnect, and a bounded window applies backpressure to producers
//! - **Offset resume**: each attachment tracks the last offset it delivered and
//!   reattaches from there, dropping DATA it has already seen
//! - **Liveness**: periodic pings detect half-open connections
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use driftmq_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let session = Session::connect("localhost:7070", SessionOptions::default())?;
//!
//!     session.subscribe("orders", |message| {
//!         println!(
//!             "{} @ {}: {}",
//!             message.topic,
//!             message.offset,
//!             String::from_utf8_lossy(&message.payload)
//!         );
//!     })?;
//!
//!     let ack = session.publish("orders", "Hello DriftMQ!").await?;
//!     let seq = ack.wait().await?;
//!     println!("Message {} stored", seq);
//!
//!     session.close().await
//! }
//! ```

pub mod attachment;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod session;
pub mod window;

pub use attachment::{AttachedHandler, AttachmentSet, AttachmentState, MessageHandler};
pub use config::*;
pub use connection::{AsyncStream, BoxedStream, ConnectionState, Dialer, TcpDialer};
pub use error::ClientError;
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use session::{PendingAck, Session};
pub use window::{QueuedPublish, SlidingWindow};

pub use driftmq::{Message, Offset, SeqNum};

/// Client library result type
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
