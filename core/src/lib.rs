//! # DriftMQ Core Library
//!
//! DriftMQ is a lightweight topic-based publish/subscribe broker with
//! at-least-once delivery and offset-based resume. This crate holds the broker
//! side plus the wire protocol shared with `driftmq-client`.
//!
//! ## Architecture Overview
//!
//! - [`protocol`] - Binary framing and typed commands
//! - [`storage`] - Segmented, offset-addressed commit log per topic
//! - [`broker`] - Topics, subscriptions, connection handling and the TCP server
//! - [`topic_manager`] - Registry that creates topics lazily and recovers them at startup
//! - [`config`] - Broker configuration
//! - [`metrics`] - Lock-free broker counters
//!
//! ## Delivery Model
//!
//! Producers send `PUBLISH` frames carrying a per-session sequence number. The
//! broker appends the payload to the topic's commit log and answers with a
//! cumulative `ACK`. Each attached consumer has a subscription that reads the
//! log from its own position and pushes `DATA` frames carrying the message
//! offset, so a consumer can always reattach from the last offset it saw.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use driftmq::{BrokerConfig, BrokerServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::default()
//!         .with_listen_addr("127.0.0.1:7070")
//!         .with_data_dir("./driftmq-data");
//!
//!     let server = BrokerServer::new(config)?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod storage;
pub mod topic_manager;

pub use broker::{BrokerServer, Subscription, Topic};
pub use config::{BrokerConfig, Persistence};
pub use metrics::{BrokerMetrics, MetricsSnapshot};
pub use protocol::{Command, Message, Offset, SeqNum, TopicName};
pub use storage::CommitLog;
pub use topic_manager::{validate_topic_name, TopicManager};

use thiserror::Error;

/// DriftMQ error types
///
/// # Example
///
/// ```rust,no_run
/// use driftmq::{DriftError, Result};
///
/// fn handle_error(result: Result<()>) {
///     match result {
///         Ok(()) => println!("Success"),
///         Err(DriftError::Storage(e)) => println!("Storage error: {}", e),
///         Err(DriftError::Network(msg)) => println!("Network error: {}", msg),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
#[derive(Debug, Error)]
pub enum DriftError {
    /// Commit log failures, including corrupt segments found during recovery
    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Malformed frames received from a peer
    #[error("Codec error: {0}")]
    Codec(#[from] protocol::CodecError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid topic name '{name}': {reason}")]
    InvalidTopic { name: String, reason: &'static str },

    #[error("Network error: {0}")]
    Network(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for DriftMQ operations
pub type Result<T> = std::result::Result<T, DriftError>;
