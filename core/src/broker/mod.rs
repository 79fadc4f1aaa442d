//! # DriftMQ Broker Module
//!
//! Topics, subscriptions and the TCP server that connects clients to them.
//!
//! ## Architecture
//!
//! - [`topic`] - A named commit log plus the wake handles of its subscribers
//! - [`subscription`] - Per-attachment delivery task reading the log at its own pace
//! - [`handler`] - Command dispatch for ATTACH, DETACH, PUBLISH and PING
//! - [`server`] - Accept loop, per-connection reader/writer tasks and shutdown
//!
//! ## Connection Model
//!
//! ```text
//!               ┌──────────────┐  PUBLISH   ┌─────────┐
//!  socket ────▶ │ reader loop  │ ─────────▶ │  Topic  │──▶ CommitLog
//!               └──────────────┘            └─────────┘
//!                      │ ATTACHED/ACK/PONG       │ notify
//!                      ▼                         ▼
//!               ┌──────────────┐   DATA   ┌──────────────┐
//!  socket ◀──── │ writer task  │ ◀─────── │ Subscription │
//!               └──────────────┘          └──────────────┘
//! ```
//!
//! Publishing never waits for consumers. Each subscription pulls from the log
//! and pushes into its connection's bounded outbound queue, so a slow consumer
//! only slows itself.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use driftmq::{BrokerConfig, BrokerServer};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Arc::new(BrokerServer::new(BrokerConfig::default())?);
//!
//!     let running = Arc::clone(&server);
//!     let task = tokio::spawn(async move { running.run().await });
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.shutdown();
//!     task.await??;
//!     Ok(())
//! }
//! ```

pub mod handler;
pub mod server;
pub mod subscription;
pub mod topic;

pub use handler::*;
pub use server::*;
pub use subscription::Subscription;
pub use topic::Topic;
