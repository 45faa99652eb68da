//! Application config
use std::{collections::HashMap, path::PathBuf, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Kafka connection shared by producer, consumer and the Kafka dead-letter sink
#[derive(Debug, Clone, Deserialize)]
pub struct Kafka {
    /// address of bootstrap kafka brokers
    pub brokers: String,
    /// topic records are published to and consumed from
    pub topic: String,
    /// consumer group to use
    pub consumer_group: String,
    /// extra librdkafka settings, applied last
    #[serde(default)]
    pub client: toml::Table,
}

impl Kafka {
    /// `client` flattened to librdkafka's string properties.
    pub fn client_settings(&self) -> HashMap<String, String> {
        self.client
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), v)
            })
            .collect()
    }
}

/// Upstream HTTP source of user profiles
#[derive(Debug, Clone, Deserialize)]
pub struct Source {
    pub url: String,
    pub request_timeout_ms: u64,
    /// pause between two fetches (0: back to back)
    pub fetch_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Producer {
    /// wire codec, must match the consumer's
    pub codec: String,
    /// delivery timeout of one publish attempt
    pub publish_timeout_ms: u64,
    /// publish attempts per record, all with the same id
    pub publish_attempts: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouse {
    pub url: String,
    pub database: String,
    pub table: String,
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Consumer {
    pub codec: String,
    /// JSON file holding per-partition checkpoints
    pub checkpoint_path: PathBuf,
    pub metadata_timeout_ms: u64,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterKind {
    File,
    Kafka,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeadLetter {
    pub kind: DeadLetterKind,
    /// JSON-lines file, used when kind = "file"
    pub path: PathBuf,
    /// topic, used when kind = "kafka" (default: "<kafka.topic>.dlq")
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub kafka: Kafka,
    pub source: Source,
    pub producer: Producer,
    pub clickhouse: ClickHouse,
    pub consumer: Consumer,
    pub dead_letter: DeadLetter,
}

impl Settings {
    /// Loads `config/default` (optional), then `cfgfile` (required), then
    /// `USERSTREAM__SECTION__KEY` environment overrides.
    pub fn new(cfgfile: &str) -> Result<Self, ConfigError> {
        Self::builder()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(cfgfile).required(true))
            .add_source(Environment::with_prefix("USERSTREAM").separator("__"))
            .build()?
            .try_deserialize()
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let retry = RetryPolicy::default();
        Config::builder()
            .set_default("kafka.brokers", "localhost:9092")?
            .set_default("kafka.topic", "users_created")?
            .set_default("kafka.consumer_group", "userstream")?
            .set_default("source.url", "https://randomuser.me/api/")?
            .set_default("source.request_timeout_ms", 10_000i64)?
            .set_default("source.fetch_interval_ms", 0i64)?
            .set_default("producer.codec", "json")?
            .set_default("producer.publish_timeout_ms", 5_000i64)?
            .set_default("producer.publish_attempts", 3i64)?
            .set_default("clickhouse.url", "tcp://localhost:9000")?
            .set_default("clickhouse.database", "spark_streams")?
            .set_default("clickhouse.table", "created_users")?
            .set_default("clickhouse.write_timeout_ms", 10_000i64)?
            .set_default("consumer.codec", "json")?
            .set_default("consumer.checkpoint_path", "/tmp/checkpoint/userstream.json")?
            .set_default("consumer.metadata_timeout_ms", 10_000i64)?
            .set_default("consumer.retry.max_retries", retry.max_retries as i64)?
            .set_default(
                "consumer.retry.initial_backoff_ms",
                retry.initial_backoff.as_millis() as i64,
            )?
            .set_default(
                "consumer.retry.max_backoff_ms",
                retry.max_backoff.as_millis() as i64,
            )?
            .set_default("consumer.retry.backoff_multiplier", retry.backoff_multiplier)?
            .set_default("dead_letter.kind", "file")?
            .set_default("dead_letter.path", "/tmp/checkpoint/userstream-dlq.jsonl")
    }

    pub fn dead_letter_topic(&self) -> String {
        self.dead_letter
            .topic
            .clone()
            .unwrap_or_else(|| format!("{}.dlq", self.kafka.topic))
    }
}

pub fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
