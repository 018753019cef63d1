use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Data source error")]
    SourceError(#[from] SourceError),

    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to connect or communicate with the source")]
    Connection {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("A transient error occurred, the operation can be retried")]
    Transient {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Unrecoverable error from the source")]
    Unrecoverable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SourceError {
    pub fn connection(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        SourceError::Connection { source: err.into() }
    }

    pub fn transient(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        SourceError::Transient { source: err.into() }
    }

    /// Transient errors are retried by the poller, everything else stops it.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient { .. })
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

#[derive(Error, Debug)]
pub enum KafkaError {
    #[error("Failed to create consumer for {destination}: {reason}")]
    ConsumerCreation { destination: String, reason: String },

    #[error("Failed to create producer: {reason}")]
    ProducerCreation { reason: String },

    #[error("Failed to subscribe to topic {topic}: {reason}")]
    Subscription { topic: String, reason: String },

    #[error("Failed to consume messages: {reason}")]
    Consumption { reason: String },

    #[error("Failed to commit offsets: {reason}")]
    OffsetCommit { reason: String },

    #[error("Failed to rewind batch {batch_id}: {reason}")]
    Seek { batch_id: i64, reason: String },

    #[error("Failed to deliver message to {topic}: {reason}")]
    Delivery { topic: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Failed to create archive table at {uri}: {reason}")]
    TableCreation { uri: String, reason: String },

    #[error("Failed to load archive table from {uri}: {reason}")]
    TableLoad { uri: String, reason: String },

    #[error("Failed to write row {key}: {reason}")]
    Write { key: String, reason: String },

    #[error("Failed to build record batch: {reason}")]
    RecordBatch { reason: String },
}

#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON serialization failed: {reason}")]
    Json { reason: String },

    #[error("YAML serialization failed: {reason}")]
    Yaml { reason: String },
}

pub type Result<T> = std::result::Result<T, NotifyError>;

impl From<serde_json::Error> for NotifyError {
    fn from(err: serde_json::Error) -> Self {
        NotifyError::Serialization(SerializationError::Json {
            reason: err.to_string(),
        })
    }
}

impl From<serde_yaml::Error> for NotifyError {
    fn from(err: serde_yaml::Error) -> Self {
        NotifyError::Serialization(SerializationError::Yaml {
            reason: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = NotifyError::from(KafkaError::Seek {
            batch_id: 4,
            reason: "unknown partition".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Kafka error: Failed to rewind batch 4: unknown partition"
        );

        let err = NotifyError::from(ConfigError::Invalid {
            message: "batch_size must be positive".to_string(),
        });
        assert!(matches!(err, NotifyError::Config(_)));
    }

    #[test]
    fn test_source_error_classification() {
        let transient = SourceError::transient("poll timed out");
        assert!(transient.is_transient());

        let fatal = SourceError::Unrecoverable("bad credentials".into());
        assert!(!fatal.is_transient());

        let conn = SourceError::connection("connection reset");
        assert!(!conn.is_transient());
    }

    #[test]
    fn test_json_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let notify_error: NotifyError = err.into();
        assert!(matches!(
            notify_error,
            NotifyError::Serialization(SerializationError::Json { .. })
        ));
    }
}
