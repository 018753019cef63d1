use std::time::Duration;

use rdkafka::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::debug;

use crate::config::PublisherOptions;
use crate::errors::KafkaError;
use crate::sink::{Delivery, Publisher};

pub struct KafkaPublisher {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(options: &PublisherOptions) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &options.bootstrap_servers)
            .set("message.timeout.ms", options.delivery_timeout_ms.to_string())
            .create()
            .map_err(|e| KafkaError::ProducerCreation {
                reason: e.to_string(),
            })?;

        Ok(Self {
            producer,
            delivery_timeout: Duration::from_millis(options.delivery_timeout_ms),
        })
    }

    /// Waits for in-flight deliveries before the process exits.
    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer
            .flush(timeout)
            .map_err(|e| KafkaError::Delivery {
                topic: "*".to_string(),
                reason: e.to_string(),
            })
    }
}

impl Publisher for KafkaPublisher {
    async fn publish(&mut self, topic: &str, payload: &str) -> Result<Delivery, KafkaError> {
        let record = FutureRecord::<(), str>::to(topic).payload(payload);
        match self.producer.send(record, self.delivery_timeout).await {
            Ok((partition, offset)) => {
                debug!(topic, partition, offset, "Published notice");
                Ok(Delivery { partition, offset })
            }
            Err((err, _message)) => Err(KafkaError::Delivery {
                topic: topic.to_string(),
                reason: err.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires a Kafka broker on localhost:9092"]
    async fn test_publish_returns_partition_and_offset() {
        let mut publisher = KafkaPublisher::new(&PublisherOptions {
            bootstrap_servers: "localhost:9092".to_string(),
            delivery_timeout_ms: 5000,
        })
        .expect("Failed to create producer");

        let first = publisher.publish("notify_log", "[]").await.unwrap();
        let second = publisher.publish("notify_log", "[]").await.unwrap();
        if first.partition == second.partition {
            assert!(second.offset > first.offset);
        }
        publisher.flush(Duration::from_secs(5)).unwrap();
    }
}
