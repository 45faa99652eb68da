//! Durable per-partition progress
//!
//! A checkpoint is the offset of the last message of a partition whose
//! outcome (row written, or message dead-lettered) is confirmed. Consumption
//! resumes at checkpoint + 1. Updates are compare-and-set and must move
//! forward; partition ownership is exclusive, so a conflict means two
//! consumers share a partition or the store was edited underneath us.
use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

pub type Partition = i32;
pub type Offset = i64;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("checkpoint file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint conflict on {topic}[{partition}]: expected {expected:?}, found {found:?}")]
    Conflict {
        topic: String,
        partition: Partition,
        expected: Option<Offset>,
        found: Option<Offset>,
    },
    #[error("checkpoint on {topic}[{partition}] cannot move back from {current} to {proposed}")]
    Regression {
        topic: String,
        partition: Partition,
        current: Offset,
        proposed: Offset,
    },
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last committed offset of every partition of `topic` that has one.
    async fn load(&self, topic: &str) -> Result<HashMap<Partition, Offset>, CheckpointError>;

    /// Moves the checkpoint of one partition from `expected` to `offset`.
    async fn compare_and_set(
        &self,
        topic: &str,
        partition: Partition,
        expected: Option<Offset>,
        offset: Offset,
    ) -> Result<(), CheckpointError>;
}

type State = BTreeMap<String, BTreeMap<Partition, Offset>>;

fn apply(
    state: &mut State,
    topic: &str,
    partition: Partition,
    expected: Option<Offset>,
    offset: Offset,
) -> Result<(), CheckpointError> {
    let found = state.get(topic).and_then(|p| p.get(&partition)).copied();
    if found != expected {
        return Err(CheckpointError::Conflict {
            topic: topic.to_owned(),
            partition,
            expected,
            found,
        });
    }
    if let Some(current) = found {
        if offset < current {
            return Err(CheckpointError::Regression {
                topic: topic.to_owned(),
                partition,
                current,
                proposed: offset,
            });
        }
    }
    state
        .entry(topic.to_owned())
        .or_default()
        .insert(partition, offset);
    Ok(())
}

/// Checkpoints kept in a single JSON file, replaced atomically on every update.
pub struct FileCheckpointStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl FileCheckpointStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();
        let state = match fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => State::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| {
                CheckpointError::Corrupt {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => State::new(),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn persist(&self, state: &State) -> Result<(), CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(state).map_err(|source| CheckpointError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let dir = match self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            Some(d) => d.to_path_buf(),
            None => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).await.map_err(io_err)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut f = fs::File::create(&tmp).await.map_err(io_err)?;
        f.write_all(&bytes).await.map_err(io_err)?;
        f.sync_all().await.map_err(io_err)?;
        fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        // the rename is durable only once its directory entry is
        fs::File::open(&dir)
            .await
            .map_err(io_err)?
            .sync_all()
            .await
            .map_err(io_err)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, topic: &str) -> Result<HashMap<Partition, Offset>, CheckpointError> {
        let state = self.state.lock().await;
        Ok(state
            .get(topic)
            .map(|p| p.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default())
    }

    async fn compare_and_set(
        &self,
        topic: &str,
        partition: Partition,
        expected: Option<Offset>,
        offset: Offset,
    ) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        apply(&mut next, topic, partition, expected, offset)?;
        // memory only moves once the file does
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }
}

/// In-process checkpoints, lost on exit.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    state: std::sync::Mutex<State>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, topic: &str, partition: Partition) -> Option<Offset> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.get(topic).and_then(|p| p.get(&partition)).copied()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, topic: &str) -> Result<HashMap<Partition, Offset>, CheckpointError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .get(topic)
            .map(|p| p.iter().map(|(k, v)| (*k, *v)).collect())
            .unwrap_or_default())
    }

    async fn compare_and_set(
        &self,
        topic: &str,
        partition: Partition,
        expected: Option<Offset>,
        offset: Offset,
    ) -> Result<(), CheckpointError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        apply(&mut state, topic, partition, expected, offset)
    }
}
