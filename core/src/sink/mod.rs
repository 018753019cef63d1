pub mod delta;
pub mod kafka;

use std::future::Future;

use crate::errors::{ArchiveError, KafkaError};

/// Where a published notice landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub partition: i32,
    pub offset: i64,
}

/// The queue notices are published to.
pub trait Publisher {
    fn publish(
        &mut self,
        topic: &str,
        payload: &str,
    ) -> impl Future<Output = Result<Delivery, KafkaError>>;
}

/// One archived batch: the notice as published plus the raw batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRecord {
    /// `{topic}-{partition}-{offset}` of the published notice.
    pub key: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub notice: String,
    pub message: String,
}

impl ArchiveRecord {
    pub fn new(topic: &str, delivery: Delivery, notice: String, message: String) -> Self {
        Self {
            key: format!("{}-{}-{}", topic, delivery.partition, delivery.offset),
            topic: topic.to_string(),
            partition: delivery.partition,
            offset: delivery.offset,
            notice,
            message,
        }
    }
}

/// Column store receiving one row per processed batch.
pub trait ArchiveWriter {
    fn put(&mut self, record: &ArchiveRecord) -> impl Future<Output = Result<(), ArchiveError>>;
}

/// `None` archives nothing.
impl<W: ArchiveWriter> ArchiveWriter for Option<W> {
    async fn put(&mut self, record: &ArchiveRecord) -> Result<(), ArchiveError> {
        match self {
            Some(writer) => writer.put(record).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_record_key() {
        let record = ArchiveRecord::new(
            "notify_log",
            Delivery {
                partition: 2,
                offset: 41,
            },
            "[]".to_string(),
            "{}".to_string(),
        );
        assert_eq!(record.key, "notify_log-2-41");
        assert_eq!(record.topic, "notify_log");
    }

    #[tokio::test]
    async fn test_disabled_archive_accepts_everything() {
        let mut archive: Option<delta::DeltaArchive> = None;
        let record = ArchiveRecord::new(
            "t",
            Delivery {
                partition: 0,
                offset: 0,
            },
            String::new(),
            String::new(),
        );
        archive.put(&record).await.unwrap();
    }
}
