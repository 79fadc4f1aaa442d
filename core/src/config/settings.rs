use super::BrokerConfig;
use crate::Result;
use config::{Config, Environment, File};
use std::path::Path;

impl BrokerConfig {
    /// Load from `DRIFTMQ_*` environment variables over the defaults
    pub fn from_env() -> Result<Self> {
        Self::load(None::<&Path>)
    }

    /// Load from an optional config file (any format the `config` crate
    /// recognizes by extension) with `DRIFTMQ_*` environment variables layered
    /// on top.
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.as_ref()));
        }

        let settings = builder
            .add_source(Environment::with_prefix("DRIFTMQ"))
            .build()
            .map_err(|e| crate::DriftError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<BrokerConfig>()
            .map_err(|e| crate::DriftError::Config(e.to_string()))?;

        config.validate().map_err(crate::DriftError::Config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Persistence;
    use std::io::Write;

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "listen_addr = \"127.0.0.1:9000\"\npersistence = \"file\"\nsegment_size = 4096"
        )
        .unwrap();

        let config = BrokerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.persistence, Persistence::File);
        assert_eq!(config.segment_size, 4096);
        assert_eq!(config.flush_interval_ms, 1000);
    }

    #[test]
    fn test_invalid_file_values_are_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "segment_size = 0").unwrap();

        let err = BrokerConfig::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, crate::DriftError::Config(_)));
    }
}
