//! Command consumer
//!
//! Subscribes to the partitioned command topic with one independent reader
//! per partition and multiplexes everything into a single bounded channel
//! for the dispatcher. Order is preserved within a partition and undefined
//! across partitions; upstream keys causally related commands into the same
//! partition.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::commands::COMMAND_TOPIC;
use crate::error::{Error, Result};

/// Fan-in buffer between the partition readers and the dispatcher.
const FAN_IN_CAPACITY: usize = 100;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// One raw broker message, not yet filtered or parsed.
#[derive(Debug, Clone)]
pub struct CommandMessage {
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub partition: i32,
}

pub struct CommandConsumer {
    consumer: Arc<StreamConsumer>,
    partitions: Vec<i32>,
}

impl CommandConsumer {
    /// Create the consumer and discover the topic's partitions, retrying
    /// while the brokers (or the topic) come up.
    pub async fn connect(
        brokers: &[String],
        worker_id: &str,
        attempts: u32,
        delay: Duration,
    ) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("group.id", worker_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()?;
        let consumer = Arc::new(consumer);

        for attempt in 1..=attempts {
            match Self::discover_partitions(&consumer) {
                Ok(partitions) => {
                    info!(
                        topic = COMMAND_TOPIC,
                        partitions = partitions.len(),
                        attempt,
                        "connected to command topic"
                    );
                    return Ok(Self {
                        consumer,
                        partitions,
                    });
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        error = %e,
                        attempt,
                        attempts,
                        "command topic not reachable yet, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(error = %e, attempts, "could not reach command topic");
                    return Err(Error::RetriesExhausted("kafka consumer", attempts));
                }
            }
        }
        Err(Error::RetriesExhausted("kafka consumer", attempts))
    }

    fn discover_partitions(consumer: &StreamConsumer) -> Result<Vec<i32>> {
        let metadata = consumer.fetch_metadata(Some(COMMAND_TOPIC), METADATA_TIMEOUT)?;
        let partitions: Vec<i32> = metadata
            .topics()
            .iter()
            .find(|t| t.name() == COMMAND_TOPIC)
            .map(|t| t.partitions().iter().map(|p| p.id()).collect())
            .unwrap_or_default();
        if partitions.is_empty() {
            return Err(Error::Configuration(format!(
                "topic {COMMAND_TOPIC} has no partitions"
            )));
        }
        Ok(partitions)
    }

    /// Assign every partition from the earliest offset, spawn one reader
    /// task per partition and return the fan-in channel.
    pub fn start(self) -> Result<mpsc::Receiver<CommandMessage>> {
        let mut assignment = TopicPartitionList::new();
        for partition in &self.partitions {
            assignment.add_partition_offset(COMMAND_TOPIC, *partition, Offset::Beginning)?;
        }
        self.consumer.assign(&assignment)?;

        let (tx, rx) = mpsc::channel(FAN_IN_CAPACITY);

        for partition in self.partitions {
            let queue = self
                .consumer
                .split_partition_queue(COMMAND_TOPIC, partition)
                .ok_or_else(|| {
                    Error::Configuration(format!("partition {partition} is not assigned"))
                })?;
            let tx = tx.clone();
            tokio::spawn(async move {
                info!(partition, "partition reader started");
                loop {
                    let message = match queue.recv().await {
                        Ok(message) => CommandMessage {
                            key: message
                                .key()
                                .map(|k| String::from_utf8_lossy(k).into_owned()),
                            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                            partition,
                        },
                        Err(e) => {
                            error!(partition, error = %e, "partition read failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    };
                    if tx.send(message).await.is_err() {
                        warn!(partition, "dispatcher gone, partition reader exiting");
                        return;
                    }
                }
            });
        }

        // With every partition split off, the main stream should stay
        // silent; it still has to be driven for librdkafka's event loop.
        let consumer = Arc::clone(&self.consumer);
        tokio::spawn(async move {
            loop {
                match consumer.recv().await {
                    Ok(message) => {
                        warn!(partition = message.partition(), "message on unsplit main stream");
                    }
                    Err(e) => {
                        error!(error = %e, "main consumer stream error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "Requires Kafka broker"]
    async fn consumes_from_all_partitions() {
        let brokers = vec!["localhost:9092".to_string()];
        let consumer =
            CommandConsumer::connect(&brokers, "sfu-test", 3, Duration::from_secs(1))
                .await
                .unwrap();
        let mut rx = consumer.start().unwrap();
        let message = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap();
        assert!(message.is_some());
    }
}
