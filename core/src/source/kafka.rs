use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SourceOptions;
use crate::errors::{KafkaError, SourceError};
use crate::source::{Batch, Connection, Connector, EMPTY_BATCH_ID, SourceMessage};

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens one Kafka consumer per destination. A destination maps to the topic
/// `topic_prefix + destination`, which a canal server fills with change
/// entries.
#[derive(Debug, Clone)]
pub struct KafkaConnector {
    options: SourceOptions,
}

impl KafkaConnector {
    pub fn new(options: SourceOptions) -> Self {
        Self { options }
    }

    pub fn topic_for(&self, destination: &str) -> String {
        format!("{}{}", self.options.topic_prefix, destination)
    }
}

impl Connector for KafkaConnector {
    type Connection = KafkaConnection;

    async fn connect(&self, destination: &str) -> Result<KafkaConnection, SourceError> {
        let topic = self.topic_for(destination);
        let consumer = create_consumer(&self.options).map_err(|e| {
            SourceError::connection(KafkaError::ConsumerCreation {
                destination: destination.to_string(),
                reason: e.to_string(),
            })
        })?;

        consumer.subscribe(&[topic.as_str()]).map_err(|e| {
            SourceError::connection(KafkaError::Subscription {
                topic: topic.clone(),
                reason: e.to_string(),
            })
        })?;

        info!(destination, topic = %topic, "Subscribed to destination");

        Ok(KafkaConnection {
            consumer,
            destination: destination.to_string(),
            batch_timeout: Duration::from_millis(self.options.batch_timeout_ms),
            next_batch_id: 1,
            pending: None,
        })
    }
}

fn create_consumer(options: &SourceOptions) -> rdkafka::error::KafkaResult<StreamConsumer> {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", &options.bootstrap_servers)
        .set("group.id", &options.consumer_group)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .set(
            "auto.offset.reset",
            options.auto_offset_reset.as_deref().unwrap_or("earliest"),
        );

    if let Some(timeout) = options.session_timeout_ms {
        client_config.set("session.timeout.ms", timeout.to_string());
    }

    if let Some(heartbeat) = options.heartbeat_interval_ms {
        client_config.set("heartbeat.interval.ms", heartbeat.to_string());
    }

    if let Some(security_protocol) = &options.security_protocol {
        client_config.set("security.protocol", security_protocol);
    }

    if let Some(sasl_mechanisms) = &options.sasl_mechanisms {
        client_config.set("sasl.mechanisms", sasl_mechanisms);
    }

    if let Some(sasl_username) = &options.sasl_username {
        client_config.set("sasl.username", sasl_username);
    }

    if let Some(sasl_password) = &options.sasl_password {
        client_config.set("sasl.password", sasl_password);
    }

    if let Some(ssl_ca_location) = &options.ssl_ca_location {
        client_config.set("ssl.ca.location", ssl_ca_location);
    }

    client_config.create()
}

/// First and last offset a pending batch covers in one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OffsetRange {
    first: i64,
    last: i64,
}

/// The batch handed out by the last fetch and not yet resolved.
#[derive(Debug)]
struct PendingBatch {
    id: i64,
    ranges: BTreeMap<(String, i32), OffsetRange>,
}

impl PendingBatch {
    fn from_messages(id: i64, messages: &[SourceMessage]) -> Self {
        let mut ranges: BTreeMap<(String, i32), OffsetRange> = BTreeMap::new();
        for message in messages {
            ranges
                .entry((message.topic.clone(), message.partition))
                .and_modify(|range| {
                    range.first = range.first.min(message.offset);
                    range.last = range.last.max(message.offset);
                })
                .or_insert(OffsetRange {
                    first: message.offset,
                    last: message.offset,
                });
        }
        Self { id, ranges }
    }

    /// Offsets to commit so the group resumes right after this batch.
    fn commit_list(&self) -> rdkafka::error::KafkaResult<TopicPartitionList> {
        let mut tpl = TopicPartitionList::new();
        for ((topic, partition), range) in &self.ranges {
            tpl.add_partition_offset(topic, *partition, Offset::Offset(range.last + 1))?;
        }
        Ok(tpl)
    }
}

pub struct KafkaConnection {
    consumer: StreamConsumer,
    destination: String,
    batch_timeout: Duration,
    next_batch_id: i64,
    pending: Option<PendingBatch>,
}

impl KafkaConnection {
    async fn consume_batch(&self, batch_size: usize) -> Result<Vec<SourceMessage>, SourceError> {
        let mut messages = Vec::new();
        let start_time = Instant::now();

        while messages.len() < batch_size {
            let Some(remaining) = self.batch_timeout.checked_sub(start_time.elapsed()) else {
                break;
            };

            match timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    debug!(
                        destination = %self.destination,
                        "Received message from partition {} offset {}",
                        message.partition(),
                        message.offset()
                    );
                    messages.push(convert_message(&message));
                }
                Ok(Err(e)) => {
                    if messages.is_empty() {
                        return Err(SourceError::transient(KafkaError::Consumption {
                            reason: e.to_string(),
                        }));
                    }
                    warn!(destination = %self.destination, "Error receiving message: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }

        Ok(messages)
    }
}

/// Moves every partition of `pending` back to the batch's first offset.
fn seek_to_start(consumer: &StreamConsumer, pending: &PendingBatch) -> Result<(), SourceError> {
    for ((topic, partition), range) in &pending.ranges {
        consumer
            .seek(topic, *partition, Offset::Offset(range.first), SEEK_TIMEOUT)
            .map_err(|e| {
                SourceError::transient(KafkaError::Seek {
                    batch_id: pending.id,
                    reason: e.to_string(),
                })
            })?;
    }
    Ok(())
}

/// Runs `resolve` on the pending batch if it is `batch_id`. The batch stays
/// pending when `resolve` fails so that it can be resolved again. Resolving
/// any other id is a no-op.
fn resolve_pending(
    pending: &mut Option<PendingBatch>,
    destination: &str,
    batch_id: i64,
    resolve: impl FnOnce(&PendingBatch) -> Result<(), SourceError>,
) -> Result<(), SourceError> {
    match pending.take() {
        Some(batch) if batch.id == batch_id => {
            let result = resolve(&batch);
            if result.is_err() {
                *pending = Some(batch);
            }
            result
        }
        other => {
            warn!(
                destination,
                batch_id,
                pending = ?other.as_ref().map(|p| p.id),
                "Resolving a batch that is not pending"
            );
            *pending = other;
            Ok(())
        }
    }
}

impl Connection for KafkaConnection {
    type Message = SourceMessage;

    async fn fetch(&mut self, max_size: usize) -> Result<Batch<SourceMessage>, SourceError> {
        let messages = self.consume_batch(max_size).await?;
        if messages.is_empty() {
            return Ok(Batch::empty());
        }

        let id = self.next_batch_id;
        self.next_batch_id += 1;

        if let Some(stale) = self.pending.replace(PendingBatch::from_messages(id, &messages)) {
            warn!(
                destination = %self.destination,
                batch_id = stale.id,
                "Fetched again before the previous batch was resolved"
            );
        }

        info!(
            destination = %self.destination,
            batch_id = id,
            messages = messages.len(),
            "Consumed batch"
        );
        Ok(Batch::new(id, messages))
    }

    async fn acknowledge(&mut self, batch_id: i64) -> Result<(), SourceError> {
        if batch_id == EMPTY_BATCH_ID {
            return Ok(());
        }

        let consumer = &self.consumer;
        resolve_pending(&mut self.pending, &self.destination, batch_id, |pending| {
            let tpl = pending.commit_list().map_err(|e| {
                SourceError::Unrecoverable(Box::new(KafkaError::OffsetCommit {
                    reason: e.to_string(),
                }))
            })?;
            consumer.commit(&tpl, CommitMode::Sync).map_err(|e| {
                SourceError::transient(KafkaError::OffsetCommit {
                    reason: e.to_string(),
                })
            })
        })?;

        debug!(destination = %self.destination, batch_id, "Committed batch offsets");
        Ok(())
    }

    async fn rollback(&mut self, batch_id: i64) -> Result<(), SourceError> {
        if batch_id == EMPTY_BATCH_ID {
            return Ok(());
        }

        let consumer = &self.consumer;
        resolve_pending(&mut self.pending, &self.destination, batch_id, |pending| {
            seek_to_start(consumer, pending)
        })?;

        debug!(destination = %self.destination, batch_id, "Rewound batch for redelivery");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.consumer.unsubscribe();
        info!(destination = %self.destination, "Unsubscribed from destination");
        Ok(())
    }
}

fn convert_message(message: &BorrowedMessage<'_>) -> SourceMessage {
    let mut headers = HashMap::new();
    if let Some(header_map) = message.headers() {
        for header in header_map.iter() {
            if let Some(value) = header.value {
                headers.insert(header.key.to_string(), value.to_vec());
            }
        }
    }

    SourceMessage {
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryOptions;
    use rdkafka::producer::{FutureProducer, FutureRecord};

    const KAFKA_BOOTSTRAP_SERVERS: &str = "localhost:9092";

    fn message(partition: i32, offset: i64) -> SourceMessage {
        SourceMessage {
            payload: b"{}".to_vec(),
            topic: "canal.example".to_string(),
            partition,
            offset,
            headers: HashMap::new(),
        }
    }

    fn options() -> SourceOptions {
        SourceOptions {
            bootstrap_servers: KAFKA_BOOTSTRAP_SERVERS.to_string(),
            consumer_group: "cdc-notify-test".to_string(),
            destinations: vec!["example".to_string()],
            topic_prefix: "canal.".to_string(),
            batch_size: 5,
            batch_timeout_ms: 2000,
            idle_backoff_ms: 300,
            retry: RetryOptions::default(),
            security_protocol: None,
            sasl_mechanisms: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            auto_offset_reset: Some("earliest".to_string()),
            session_timeout_ms: Some(6000),
            heartbeat_interval_ms: None,
        }
    }

    #[test]
    fn test_pending_batch_tracks_offset_ranges() {
        let pending = PendingBatch::from_messages(
            3,
            &[message(0, 10), message(1, 4), message(0, 12), message(0, 11)],
        );

        assert_eq!(pending.id, 3);
        assert_eq!(
            pending.ranges[&("canal.example".to_string(), 0)],
            OffsetRange { first: 10, last: 12 }
        );
        assert_eq!(
            pending.ranges[&("canal.example".to_string(), 1)],
            OffsetRange { first: 4, last: 4 }
        );

        let tpl = pending.commit_list().unwrap();
        let committed = tpl.find_partition("canal.example", 0).unwrap();
        assert_eq!(committed.offset(), Offset::Offset(13));
    }

    #[test]
    fn test_failed_resolution_keeps_batch_pending() {
        let mut pending = Some(PendingBatch::from_messages(5, &[message(0, 10)]));

        let failed = resolve_pending(&mut pending, "example", 5, |_| {
            Err(SourceError::transient("seek timed out"))
        });
        assert!(failed.is_err());
        assert_eq!(pending.as_ref().map(|p| p.id), Some(5));

        // resolving some other batch leaves the pending one alone
        resolve_pending(&mut pending, "example", 4, |_| unreachable!()).unwrap();
        assert_eq!(pending.as_ref().map(|p| p.id), Some(5));

        let mut resolved_ranges = 0;
        resolve_pending(&mut pending, "example", 5, |batch| {
            resolved_ranges = batch.ranges.len();
            Ok(())
        })
        .unwrap();
        assert_eq!(resolved_ranges, 1);
        assert!(pending.is_none());
    }

    #[test]
    fn test_topic_for_destination() {
        let connector = KafkaConnector::new(options());
        assert_eq!(connector.topic_for("example"), "canal.example");
    }

    #[tokio::test]
    #[ignore = "requires a Kafka broker on localhost:9092"]
    async fn test_kafka_connection_fetch_rollback_and_ack() {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", KAFKA_BOOTSTRAP_SERVERS)
            .set("message.timeout.ms", "5000")
            .create()
            .expect("Failed to create producer");

        for i in 0..3 {
            let payload = format!("{{\"entryType\":\"HEARTBEAT\",\"seq\":{}}}", i);
            producer
                .send(
                    FutureRecord::<(), _>::to("canal.example").payload(&payload),
                    Duration::from_secs(5),
                )
                .await
                .expect("Failed to send message");
        }

        let connector = KafkaConnector::new(options());
        let mut connection = connector
            .connect("example")
            .await
            .expect("Failed to connect");

        let mut batch = connection.fetch(5).await.expect("fetch failed");
        while batch.is_empty() {
            batch = connection.fetch(5).await.expect("fetch failed");
        }
        let first_offsets: Vec<i64> = batch.messages.iter().map(|m| m.offset).collect();

        connection.rollback(batch.id).await.expect("rollback failed");

        let redelivered = connection.fetch(5).await.expect("fetch failed");
        let redelivered_offsets: Vec<i64> =
            redelivered.messages.iter().map(|m| m.offset).collect();
        assert_eq!(first_offsets, redelivered_offsets);
        assert_ne!(batch.id, redelivered.id);

        connection
            .acknowledge(redelivered.id)
            .await
            .expect("ack failed");
        connection.close().await.expect("close failed");
    }
}
