use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    error::{KafkaError, RDKafkaErrorCode},
    producer::{FutureProducer, FutureRecord},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("delivery not confirmed within {0:?}")]
    Timeout(Duration),
    #[error("broker rejected message: {0}")]
    Rejected(String),
}

/// Topic writer used by the producer.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns once the broker acknowledged the message.
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), PublishError>;
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

/// Producer client shared by the publisher and the Kafka dead-letter sink.
pub fn create_producer(
    brokers: &str,
    timeout: Duration,
    extra: &HashMap<String, String>,
) -> Result<FutureProducer, KafkaError> {
    let mut cfg = ClientConfig::new();
    cfg.set("bootstrap.servers", brokers)
        .set("message.timeout.ms", timeout.as_millis().to_string());
    for (k, v) in extra {
        cfg.set(k, v);
    }
    cfg.create()
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer, topic: &str, timeout: Duration) -> Self {
        Self {
            producer,
            topic: topic.to_owned(),
            timeout,
        }
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, key: &str, payload: &[u8]) -> Result<(), PublishError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(payload);
        match self.producer.send(record, self.timeout).await {
            Ok(_) => Ok(()),
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut), _)) => {
                Err(PublishError::Timeout(self.timeout))
            }
            Err((e, _)) => Err(PublishError::Rejected(e.to_string())),
        }
    }
}
