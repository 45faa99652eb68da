//! Side channel for messages that can never be written
//!
//! A dead letter keeps the raw payload and where it came from, so rejected
//! messages can be inspected and replayed offline.
use std::{
    io,
    path::{Path, PathBuf},
    sync::Mutex as SyncMutex,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};

use crate::checkpoint::{Offset, Partition};

/// Pipeline stage that rejected the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Decode,
    Schema,
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub topic: String,
    pub partition: Partition,
    pub offset: Offset,
    pub stage: Stage,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    /// Original message bytes, empty for tombstones.
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead letter file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serializing dead letter: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("publishing dead letter to {topic}: {reason}")]
    Kafka { topic: String, reason: String },
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Returns once the letter is durable; the caller advances past it afterwards.
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

/// Appends one JSON document per line.
pub struct FileDeadLetter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileDeadLetter {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    /// Reads back every letter in the file.
    pub async fn read_all(&self) -> Result<Vec<DeadLetter>, DeadLetterError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(DeadLetterError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(DeadLetterError::from))
            .collect()
    }
}

#[async_trait]
impl DeadLetterSink for FileDeadLetter {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_vec(letter)?;
        line.push(b'\n');
        let io_err = |source| DeadLetterError::Io {
            path: self.path.clone(),
            source,
        };
        let _guard = self.lock.lock().await;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        f.write_all(&line).await.map_err(io_err)?;
        f.sync_data().await.map_err(io_err)
    }
}

/// Publishes letters as JSON to a dedicated topic, keyed by source position.
pub struct KafkaDeadLetter {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaDeadLetter {
    pub fn new(producer: FutureProducer, topic: &str, timeout: Duration) -> Self {
        Self {
            producer,
            topic: topic.to_owned(),
            timeout,
        }
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetter {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_vec(letter)?;
        let key = format!("{}-{}-{}", letter.topic, letter.partition, letter.offset);
        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);
        self.producer
            .send(record, self.timeout)
            .await
            .map(|_| ())
            .map_err(|(e, _)| DeadLetterError::Kafka {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })
    }
}

/// Keeps letters in memory.
#[derive(Default)]
pub struct MemoryDeadLetter {
    letters: SyncMutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetter {
    async fn send(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(letter.clone());
        Ok(())
    }
}
