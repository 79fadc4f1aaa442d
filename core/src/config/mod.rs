pub mod settings;

use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::storage::DEFAULT_SEGMENT_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where topic logs are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persistence {
    /// Segments live in RAM and are lost on restart
    Memory,
    /// One directory per topic under `data_dir`, recovered at startup
    File,
}

impl std::str::FromStr for Persistence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Persistence::Memory),
            "file" => Ok(Persistence::File),
            other => Err(format!("unknown persistence mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub listen_addr: String,
    pub persistence: Persistence,
    pub data_dir: PathBuf,
    pub segment_size: u64,
    pub flush_interval_ms: u64,
    pub max_frame_size: usize,
    /// Frames buffered per connection before subscription delivery waits
    pub outbound_queue_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7070".to_string(),
            persistence: Persistence::Memory,
            data_dir: PathBuf::from("./data"),
            segment_size: DEFAULT_SEGMENT_SIZE,
            flush_interval_ms: 1000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            outbound_queue_size: 1024,
        }
    }
}

impl BrokerConfig {
    /// File-backed configuration rooted at `data_dir`
    pub fn with_data_dir<P: Into<PathBuf>>(mut self, data_dir: P) -> Self {
        self.persistence = Persistence::File;
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_listen_addr<S: Into<String>>(mut self, addr: S) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Validate configuration bounds to prevent division-by-zero and resource exhaustion
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.listen_addr.is_empty() {
            return Err("listen_addr must not be empty".to_string());
        }
        if self.segment_size == 0 {
            return Err("segment_size must be > 0".to_string());
        }
        if self.flush_interval_ms == 0 {
            return Err("flush_interval_ms must be > 0".to_string());
        }
        if self.max_frame_size < crate::protocol::FRAME_HEADER_LEN {
            return Err(format!(
                "max_frame_size must be at least {} bytes",
                crate::protocol::FRAME_HEADER_LEN
            ));
        }
        if self.outbound_queue_size == 0 {
            return Err("outbound_queue_size must be > 0".to_string());
        }
        if self.persistence == Persistence::File && self.data_dir.as_os_str().is_empty() {
            return Err("data_dir is required for file persistence".to_string());
        }
        Ok(())
    }
}
