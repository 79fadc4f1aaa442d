//! # DriftMQ Topic Registry
//!
//! Topics are created lazily the first time a connection names them in an
//! ATTACH or PUBLISH frame and live for the lifetime of the process.
//!
//! ## Persistence
//!
//! With [`Persistence::File`] every topic owns a directory under `data_dir`
//! holding its segment files. [`TopicManager::open`] walks that directory at
//! startup and recovers each topic's commit log, so publishing and replay pick
//! up where the previous process stopped.
//!
//! ## Topic Names
//!
//! Because names double as directory names they are restricted to 1-249
//! characters of `[A-Za-z0-9._-]`, excluding `.` and `..`.

use crate::broker::Topic;
use crate::config::{BrokerConfig, Persistence};
use crate::storage::CommitLog;
use crate::{DriftError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub const MAX_TOPIC_NAME_LEN: usize = 249;

/// Check that `name` is usable as a topic name
pub fn validate_topic_name(name: &str) -> Result<()> {
    let invalid = |reason| {
        Err(DriftError::InvalidTopic {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.len() > MAX_TOPIC_NAME_LEN {
        return invalid("name is longer than 249 characters");
    }
    if name == "." || name == ".." {
        return invalid("name is reserved");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return invalid("name may only contain ASCII letters, digits, '.', '_' and '-'");
    }
    Ok(())
}

#[derive(Debug)]
pub struct TopicManager {
    topics: DashMap<String, Arc<Topic>>,
    data_dir: Option<PathBuf>,
    segment_size: u64,
}

impl TopicManager {
    /// Registry whose topics keep their logs in RAM
    pub fn in_memory(segment_size: u64) -> Self {
        Self {
            topics: DashMap::new(),
            data_dir: None,
            segment_size,
        }
    }

    /// Registry for the configured persistence mode, recovering any topics
    /// already present under `data_dir`
    pub fn open(config: &BrokerConfig) -> Result<Self> {
        match config.persistence {
            Persistence::Memory => Ok(Self::in_memory(config.segment_size)),
            Persistence::File => {
                let manager = Self {
                    topics: DashMap::new(),
                    data_dir: Some(config.data_dir.clone()),
                    segment_size: config.segment_size,
                };
                manager.recover()?;
                Ok(manager)
            }
        }
    }

    fn recover(&self) -> Result<()> {
        let Some(data_dir) = &self.data_dir else {
            return Ok(());
        };
        std::fs::create_dir_all(data_dir)?;

        for entry in std::fs::read_dir(data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!("Skipping non UTF-8 directory {:?}", entry.path());
                continue;
            };
            if validate_topic_name(&name).is_err() {
                warn!("Skipping directory {:?}: not a valid topic name", entry.path());
                continue;
            }

            let log = CommitLog::open(entry.path(), self.segment_size)?;
            info!(
                "Recovered topic '{}' ({} segment(s), end offset {})",
                name,
                log.segment_count(),
                log.end_offset()
            );
            self.topics.insert(name.clone(), Arc::new(Topic::new(name, log)));
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.get(name).map(|topic| Arc::clone(topic.value()))
    }

    /// Look a topic up, creating it on first reference
    pub fn get_or_create(&self, name: &str) -> Result<Arc<Topic>> {
        if let Some(topic) = self.get(name) {
            return Ok(topic);
        }
        validate_topic_name(name)?;

        match self.topics.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let log = match &self.data_dir {
                    Some(dir) => CommitLog::open(dir.join(name), self.segment_size)?,
                    None => CommitLog::in_memory(self.segment_size),
                };
                let topic = Arc::new(Topic::new(name.to_string(), log));
                entry.insert(Arc::clone(&topic));
                info!("Created topic '{}'", name);
                Ok(topic)
            }
        }
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    pub fn is_persistent(&self) -> bool {
        self.data_dir.is_some()
    }

    /// Flush every topic's log. Keeps going past failures and returns the
    /// first one.
    pub fn flush_all(&self) -> Result<()> {
        let topics: Vec<Arc<Topic>> = self.topics.iter().map(|t| Arc::clone(t.value())).collect();

        let mut first_error = None;
        for topic in topics {
            if let Err(e) = topic.flush() {
                warn!("Failed to flush topic '{}': {}", topic.name(), e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_valid_topic_names() {
        for name in ["orders", "a", "metrics.cpu-0", "under_score", "..."] {
            assert!(validate_topic_name(name).is_ok(), "{}", name);
        }
    }

    #[test]
    fn test_invalid_topic_names() {
        let too_long = "x".repeat(MAX_TOPIC_NAME_LEN + 1);
        for name in ["", ".", "..", "a/b", "../etc", "white space", "ümlaut", too_long.as_str()] {
            assert!(
                matches!(
                    validate_topic_name(name),
                    Err(DriftError::InvalidTopic { .. })
                ),
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_topics_are_created_once() {
        let manager = TopicManager::in_memory(1024);
        let first = manager.get_or_create("foo").unwrap();
        let second = manager.get_or_create("foo").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len(), 1);
        assert!(manager.get("bar").is_none());
    }

    #[test]
    fn test_invalid_name_is_not_created() {
        let manager = TopicManager::in_memory(1024);
        assert!(manager.get_or_create("../escape").is_err());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_file_topics_recovered_on_open() {
        let dir = tempdir().unwrap();
        let config = BrokerConfig::default().with_data_dir(dir.path());

        {
            let manager = TopicManager::open(&config).unwrap();
            let orders = manager.get_or_create("orders").unwrap();
            orders.publish(b"first").unwrap();
            orders.publish(b"second").unwrap();
            manager.get_or_create("empty").unwrap();
            manager.flush_all().unwrap();
        }
        std::fs::write(dir.path().join("stray-file"), b"ignored").unwrap();

        let manager = TopicManager::open(&config).unwrap();
        assert!(manager.is_persistent());
        assert_eq!(manager.topic_names(), vec!["empty", "orders"]);

        let orders = manager.get("orders").unwrap();
        assert_eq!(orders.offset(), 9 + 10);
        assert_eq!(orders.publish(b"third").unwrap(), 19 + 9);
    }
}
