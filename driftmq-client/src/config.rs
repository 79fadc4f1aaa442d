//! Configuration types for the DriftMQ client

use crate::attachment::AttachedHandler;
use crate::backoff::exponential_backoff;
use crate::connection::{ConnectionState, Dialer, TcpDialer};
use crate::error::ClientError;
use driftmq::protocol::DEFAULT_MAX_FRAME_SIZE;
use driftmq::Offset;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Maps a reconnect attempt number (0-based) to the delay before it
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Observer for session connection state changes
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Session configuration
#[derive(Clone)]
pub struct SessionOptions {
    /// How to open a stream to the broker
    pub dialer: Arc<dyn Dialer>,
    /// Maximum unacknowledged publishes before `publish` waits
    pub window_size: usize,
    /// Interval between liveness pings
    pub ping_interval: Duration,
    /// Unanswered pings tolerated before the connection is declared dead
    pub max_ping_out: u32,
    /// Reconnect delay policy
    pub backoff: BackoffFn,
    /// Called on every connection state change
    pub on_state_change: Option<StateCallback>,
    /// Upper bound for a single encoded frame, in both directions
    pub max_frame_size: usize,
    /// Give up on a single dial attempt after this long
    pub connect_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            dialer: Arc::new(TcpDialer),
            window_size: 256,
            ping_interval: Duration::from_secs(5),
            max_ping_out: 3,
            backoff: Arc::new(exponential_backoff),
            on_state_change: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("window_size", &self.window_size)
            .field("ping_interval", &self.ping_interval)
            .field("max_ping_out", &self.max_ping_out)
            .field("on_state_change", &self.on_state_change.is_some())
            .field("max_frame_size", &self.max_frame_size)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dialer<D: Dialer>(mut self, dialer: D) -> Self {
        self.dialer = Arc::new(dialer);
        self
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_max_ping_out(mut self, max_ping_out: u32) -> Self {
        self.max_ping_out = max_ping_out;
        self
    }

    pub fn with_backoff<F>(mut self, backoff: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn with_state_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.window_size == 0 {
            return Err(ClientError::invalid_config("window_size must be positive"));
        }
        if self.ping_interval.is_zero() {
            return Err(ClientError::invalid_config("ping_interval must be positive"));
        }
        if self.max_ping_out == 0 {
            return Err(ClientError::invalid_config("max_ping_out must be positive"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ClientError::invalid_config("connect_timeout must be positive"));
        }
        Ok(())
    }
}

/// Per-subscription options
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Resume after this offset instead of starting at the end of the topic
    pub from_offset: Option<Offset>,
    /// Called each time the broker confirms the attachment
    pub on_attached: Option<AttachedHandler>,
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("from_offset", &self.from_offset)
            .field("on_attached", &self.on_attached.is_some())
            .finish()
    }
}

impl SubscribeOptions {
    pub fn from_offset(offset: Offset) -> Self {
        Self {
            from_offset: Some(offset),
            on_attached: None,
        }
    }

    pub fn with_on_attached<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Offset) + Send + Sync + 'static,
    {
        self.on_attached = Some(Arc::new(callback));
        self
    }
}
