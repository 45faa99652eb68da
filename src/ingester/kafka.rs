//! Partition streams backed by a Kafka consumer
//!
//! Partitions are assigned manually, starting right after the stored
//! checkpoint, and offsets are never committed to the broker: the
//! checkpoint store is the only source of truth for progress.
use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::stream::{self, BoxStream, StreamExt};
use rdkafka::{
    config::ClientConfig,
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    message::BorrowedMessage,
    Message, Offset as KafkaOffset, TopicPartitionList,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{ConsumerError, TopicMessage};
use crate::checkpoint::{Offset, Partition};

pub type PartitionStream = BoxStream<'static, Result<TopicMessage, KafkaError>>;

pub struct KafkaConsumer {
    consumer: Arc<StreamConsumer>,
    topic: String,
}

fn to_message(m: &BorrowedMessage<'_>) -> TopicMessage {
    TopicMessage {
        partition: m.partition(),
        offset: m.offset(),
        payload: m.payload().map(<[u8]>::to_vec),
    }
}

/// Where to start reading a partition given its checkpoint.
pub fn start_offset(checkpoint: Option<Offset>) -> KafkaOffset {
    match checkpoint {
        Some(c) => KafkaOffset::Offset(c + 1),
        None => KafkaOffset::Beginning,
    }
}

/// Client settings for the partition consumer; `extra` is applied last.
pub fn client_config(
    brokers: &str,
    group: &str,
    extra: &HashMap<String, String>,
) -> ClientConfig {
    let mut cfg = ClientConfig::new();
    cfg.set("bootstrap.servers", brokers)
        .set("group.id", group)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("enable.partition.eof", "false")
        // an expired checkpoint resumes at the oldest retained message
        .set("auto.offset.reset", "earliest");
    for (k, v) in extra {
        cfg.set(k, v);
    }
    cfg
}

impl KafkaConsumer {
    pub fn new(
        brokers: &str,
        group: &str,
        topic: &str,
        extra: &HashMap<String, String>,
    ) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = client_config(brokers, group, extra).create()?;
        Ok(Self {
            consumer: Arc::new(consumer),
            topic: topic.to_owned(),
        })
    }

    pub fn partitions(&self, timeout: Duration) -> Result<Vec<Partition>, ConsumerError> {
        let metadata = self.consumer.fetch_metadata(Some(&self.topic), timeout)?;
        let partitions: Vec<Partition> = metadata
            .topics()
            .iter()
            .filter(|t| t.name() == self.topic)
            .flat_map(|t| t.partitions().iter().map(|p| p.id()))
            .collect();
        if partitions.is_empty() {
            return Err(ConsumerError::NoPartitions(self.topic.clone()));
        }
        Ok(partitions)
    }

    /// Assigns every partition of the topic and returns one ordered stream
    /// per partition.
    pub fn assign(
        &self,
        checkpoints: &HashMap<Partition, Offset>,
        timeout: Duration,
    ) -> Result<Vec<(Partition, PartitionStream)>, ConsumerError> {
        let partitions = self.partitions(timeout)?;
        self.assign_partitions(&partitions, checkpoints)
    }

    /// Assigns `partitions` starting after their checkpoints, then splits off
    /// one queue per partition. Assigning deactivates earlier splits, so the
    /// queues must be split afterwards.
    pub fn assign_partitions(
        &self,
        partitions: &[Partition],
        checkpoints: &HashMap<Partition, Offset>,
    ) -> Result<Vec<(Partition, PartitionStream)>, ConsumerError> {
        let mut tpl = TopicPartitionList::new();
        for &partition in partitions {
            let checkpoint = checkpoints.get(&partition).copied();
            tpl.add_partition_offset(&self.topic, partition, start_offset(checkpoint))?;
            info!(topic = %self.topic, partition, ?checkpoint, "assigning partition");
        }
        self.consumer.assign(&tpl)?;

        let mut streams = Vec::with_capacity(partitions.len());
        for &partition in partitions {
            let queue = self
                .consumer
                .split_partition_queue(&self.topic, partition)
                .ok_or(ConsumerError::Assignment(partition))?;
            let messages = stream::unfold(queue, |queue| async move {
                let item = queue.recv().await.map(|m| to_message(&m));
                Some((item, queue))
            })
            .boxed();
            streams.push((partition, messages));
        }
        Ok(streams)
    }

    /// Polls the main consumer queue, which services rebalance and error
    /// callbacks for the split partition queues, until cancelled.
    ///
    /// Every assigned partition has its own queue, so a message arriving here
    /// was routed around its worker: that cancels the run and is returned as
    /// an error.
    pub fn drive(&self, cancel: CancellationToken) -> JoinHandle<Result<(), ConsumerError>> {
        let consumer = self.consumer.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    m = consumer.recv() => match m {
                        Ok(m) => {
                            let (partition, offset) = (m.partition(), m.offset());
                            error!(partition, offset, "message bypassed its partition queue");
                            cancel.cancel();
                            return Err(ConsumerError::Unrouted { partition, offset });
                        }
                        Err(e) => warn!(error = %e, "kafka consumer error"),
                    },
                }
            }
        })
    }
}
