use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::consumer::ConsumerOptions;
use crate::consumer::backoff::Backoff;

pub const CONFIG_ENV: &str = "NOTIFY_CONFIG";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotifyConfig {
    /// Topic the notices are published to, also the archive row key prefix.
    pub table_name: String,
    pub source: SourceOptions,
    pub publisher: PublisherOptions,
    #[serde(default)]
    pub archive: ArchiveOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceOptions {
    pub bootstrap_servers: String,
    pub consumer_group: String,
    pub destinations: Vec<String>,
    #[serde(default)]
    pub topic_prefix: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
    #[serde(default)]
    pub retry: RetryOptions,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub auto_offset_reset: Option<String>,
    pub session_timeout_ms: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryOptions {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublisherOptions {
    pub bootstrap_servers: String,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ArchiveOptions {
    #[serde(default)]
    pub enabled: bool,
    pub table_uri: Option<String>,
}

fn default_batch_size() -> usize {
    1000
}

fn default_batch_timeout_ms() -> u64 {
    1000
}

fn default_idle_backoff_ms() -> u64 {
    300
}

fn default_delivery_timeout_ms() -> u64 {
    5000
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<NotifyConfig> {
    match config_path {
        Some(path) => NotifyConfig::from_file(path),
        None => NotifyConfig::from_env(),
    }
}

impl NotifyConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NotifyConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_str = std::env::var(CONFIG_ENV)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", CONFIG_ENV))?;
        let config: NotifyConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.table_name.is_empty() {
            return Err(anyhow::anyhow!("Table name cannot be empty"));
        }
        if self.source.destinations.is_empty() {
            return Err(anyhow::anyhow!("At least one destination must be configured"));
        }

        let mut seen = HashSet::new();
        for destination in &self.source.destinations {
            if destination.is_empty() {
                return Err(anyhow::anyhow!("Destination names cannot be empty"));
            }
            if !seen.insert(destination.as_str()) {
                return Err(anyhow::anyhow!("Duplicate destination: {}", destination));
            }
        }

        if self.source.bootstrap_servers.is_empty() {
            return Err(anyhow::anyhow!("Source bootstrap servers cannot be empty"));
        }
        if self.source.batch_size == 0 {
            return Err(anyhow::anyhow!("Batch size must be positive"));
        }
        if self.source.retry.initial_backoff_ms > self.source.retry.max_backoff_ms {
            return Err(anyhow::anyhow!(
                "Retry initial backoff cannot exceed max backoff"
            ));
        }
        if self.publisher.bootstrap_servers.is_empty() {
            return Err(anyhow::anyhow!("Publisher bootstrap servers cannot be empty"));
        }
        if self.archive.enabled
            && self.archive.table_uri.as_deref().is_none_or(str::is_empty)
        {
            return Err(anyhow::anyhow!("Archive is enabled but no table_uri is set"));
        }
        Ok(())
    }

    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            batch_size: self.source.batch_size,
            idle_backoff: Duration::from_millis(self.source.idle_backoff_ms),
            error_backoff: Backoff::new(
                Duration::from_millis(self.source.retry.initial_backoff_ms),
                Duration::from_millis(self.source.retry.max_backoff_ms),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
table_name: notify_log
source:
  bootstrap_servers: "localhost:9092"
  consumer_group: cdc-notify
  destinations: [example, orders]
  topic_prefix: "canal."
  batch_size: 500
publisher:
  bootstrap_servers: "localhost:9092"
archive:
  enabled: true
  table_uri: "/tmp/notify_log"
"#;

    fn sample() -> NotifyConfig {
        serde_yaml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_parse_config_with_defaults() {
        let config = sample();

        assert_eq!(config.table_name, "notify_log");
        assert_eq!(config.source.destinations, vec!["example", "orders"]);
        assert_eq!(config.source.topic_prefix, "canal.");
        assert_eq!(config.source.batch_size, 500);
        assert_eq!(config.source.batch_timeout_ms, 1000);
        assert_eq!(config.source.idle_backoff_ms, 300);
        assert_eq!(config.source.retry.initial_backoff_ms, 500);
        assert_eq!(config.publisher.delivery_timeout_ms, 5000);
        assert!(config.archive.enabled);

        config.validate().unwrap();
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = NotifyConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.source.consumer_group, "cdc-notify");
    }

    #[test]
    fn test_missing_file_fails() {
        assert!(NotifyConfig::from_file("/nonexistent/notify.yml").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_sources() {
        let mut config = sample();
        config.source.destinations.clear();
        assert!(config.validate().is_err());

        let mut config = sample();
        config.source.destinations.push("orders".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate destination"));

        let mut config = sample();
        config.source.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = sample();
        config.table_name.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_archive_requires_uri() {
        let mut config = sample();
        config.archive.table_uri = None;
        assert!(config.validate().is_err());

        config.archive.enabled = false;
        config.validate().unwrap();
    }

    #[test]
    fn test_consumer_options() {
        let options = sample().consumer_options();
        assert_eq!(options.batch_size, 500);
        assert_eq!(options.idle_backoff, Duration::from_millis(300));
        assert_eq!(options.error_backoff.initial(), Duration::from_millis(500));
    }
}
