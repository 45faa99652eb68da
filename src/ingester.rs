//! Topic to column store pipeline
//!
//! Each partition is handled by its own worker, strictly in offset order:
//! decode, validate, write, then checkpoint. The checkpoint of a partition
//! only ever names a message whose outcome is final, either a confirmed row
//! or a confirmed dead letter, so a restart resumes right after it and
//! replays nothing that was already committed except by idempotent upsert.
//!
//! Transient write failures are retried with backoff. Running out of retries
//! is fatal: the partition stops without advancing and the shared shutdown
//! token is cancelled, so the process exits non-zero instead of skipping data.
pub mod kafka;

use std::sync::Arc;

use chrono::Utc;
use futures::{Stream, StreamExt};
use rdkafka::error::KafkaError;
use thiserror::Error;
use tokio::{task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    checkpoint::{CheckpointError, CheckpointStore, Offset, Partition},
    codec::{Codec, CodecError},
    dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink, Stage},
    retry::RetryPolicy,
    sink::{RecordSink, WriteError},
};

/// One message as read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub partition: Partition,
    pub offset: Offset,
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("topic {0} has no partitions")]
    NoPartitions(String),
    #[error("partition {0} could not be assigned")]
    Assignment(Partition),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
    #[error("partition {partition} offset {offset}: giving up after {attempts} write attempts: {source}")]
    RetriesExhausted {
        partition: Partition,
        offset: Offset,
        attempts: usize,
        #[source]
        source: WriteError,
    },
    #[error("partition {partition} offset {offset} reached the shared queue")]
    Unrouted { partition: Partition, offset: Offset },
    #[error("partition worker died: {0}")]
    Worker(String),
}

/// Per-partition counters reported when a worker stops.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PartitionSummary {
    pub partition: Partition,
    pub written: u64,
    pub dead_lettered: u64,
    /// Redelivered messages at or below the checkpoint.
    pub skipped: u64,
    /// Times the next offset was past checkpoint + 1, e.g. after retention
    /// removed the messages that followed the checkpoint.
    pub gaps: u64,
    pub checkpoint: Option<Offset>,
}

enum Outcome {
    Written,
    DeadLettered,
    /// Shutdown arrived while waiting to retry; nothing was committed.
    Cancelled,
}

pub struct Ingester {
    topic: String,
    codec: Arc<dyn Codec + Send + Sync>,
    sink: Arc<dyn RecordSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    dead_letter: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
}

impl Ingester {
    pub fn new(
        topic: &str,
        codec: Arc<dyn Codec + Send + Sync>,
        sink: Arc<dyn RecordSink>,
        checkpoints: Arc<dyn CheckpointStore>,
        dead_letter: Arc<dyn DeadLetterSink>,
        retry: RetryPolicy,
    ) -> Ingester {
        Ingester {
            topic: topic.to_owned(),
            codec,
            sink,
            checkpoints,
            dead_letter,
            retry,
        }
    }

    /// Runs one worker per partition until every stream ends, the token is
    /// cancelled, or a worker fails. The first failure cancels the token and
    /// is returned once all workers have stopped at a message boundary.
    pub async fn run<S>(
        self: Arc<Self>,
        partitions: Vec<(Partition, S)>,
        cancel: CancellationToken,
    ) -> Result<Vec<PartitionSummary>, ConsumerError>
    where
        S: Stream<Item = Result<TopicMessage, KafkaError>> + Send + Unpin + 'static,
    {
        let checkpoints = self.checkpoints.load(&self.topic).await?;
        let mut workers = JoinSet::new();
        for (partition, messages) in partitions {
            let ingester = self.clone();
            let cancel = cancel.clone();
            let checkpoint = checkpoints.get(&partition).copied();
            workers.spawn(async move {
                ingester
                    .run_partition(partition, checkpoint, messages, cancel)
                    .await
            });
        }

        let mut summaries = Vec::new();
        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            let res = joined.unwrap_or_else(|e| Err(ConsumerError::Worker(e.to_string())));
            match res {
                Ok(summary) => summaries.push(summary),
                Err(e) => {
                    error!(topic = %self.topic, error = %e, "partition failed, shutting down");
                    cancel.cancel();
                    failure.get_or_insert(e);
                }
            }
        }
        summaries.sort_by_key(|s| s.partition);
        match failure {
            Some(e) => Err(e),
            None => Ok(summaries),
        }
    }

    /// Processes one partition in offset order starting after `checkpoint`.
    ///
    /// Cancellation is only observed between messages.
    pub async fn run_partition<S>(
        &self,
        partition: Partition,
        checkpoint: Option<Offset>,
        mut messages: S,
        cancel: CancellationToken,
    ) -> Result<PartitionSummary, ConsumerError>
    where
        S: Stream<Item = Result<TopicMessage, KafkaError>> + Unpin,
    {
        let mut summary = PartitionSummary {
            partition,
            checkpoint,
            ..Default::default()
        };
        info!(topic = %self.topic, partition, ?checkpoint, "partition worker started");
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                m = messages.next() => m,
            };
            let msg = match next {
                None => break,
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    warn!(topic = %self.topic, partition, error = %e, "error receiving message");
                    continue;
                }
            };
            if summary.checkpoint.is_some_and(|c| msg.offset <= c) {
                debug!(partition, offset = msg.offset, "already committed, skipping");
                summary.skipped += 1;
                continue;
            }
            if let Some(c) = summary.checkpoint.filter(|c| msg.offset > c + 1) {
                warn!(
                    topic = %self.topic,
                    partition,
                    checkpoint = c,
                    offset = msg.offset,
                    "resuming past a gap, offsets in between are no longer retained"
                );
                summary.gaps += 1;
            }
            match self.handle(&msg, &cancel).await? {
                Outcome::Written => summary.written += 1,
                Outcome::DeadLettered => summary.dead_lettered += 1,
                Outcome::Cancelled => break,
            }
            self.checkpoints
                .compare_and_set(&self.topic, partition, summary.checkpoint, msg.offset)
                .await?;
            summary.checkpoint = Some(msg.offset);
        }
        info!(
            topic = %self.topic,
            partition,
            written = summary.written,
            dead_lettered = summary.dead_lettered,
            gaps = summary.gaps,
            checkpoint = ?summary.checkpoint,
            "partition worker stopped"
        );
        Ok(summary)
    }

    async fn handle(
        &self,
        msg: &TopicMessage,
        cancel: &CancellationToken,
    ) -> Result<Outcome, ConsumerError> {
        let payload = msg.payload.as_deref().unwrap_or_default();
        let record = match self.codec.decode(payload) {
            Ok(r) => r,
            Err(CodecError::Decode(e)) => {
                return self.reject(msg, Stage::Decode, e.to_string()).await;
            }
            Err(CodecError::Schema(e)) => {
                return self.reject(msg, Stage::Schema, e.to_string()).await;
            }
        };

        let mut attempt = 0;
        loop {
            match self.sink.upsert(&record).await {
                Ok(()) => {
                    debug!(partition = msg.partition, offset = msg.offset, id = %record.id, "written");
                    return Ok(Outcome::Written);
                }
                Err(WriteError::Permanent(reason)) => {
                    return self.reject(msg, Stage::Write, reason).await;
                }
                Err(e) if attempt >= self.retry.max_retries => {
                    return Err(ConsumerError::RetriesExhausted {
                        partition: msg.partition,
                        offset: msg.offset,
                        attempts: attempt + 1,
                        source: e,
                    });
                }
                Err(e) => {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        partition = msg.partition,
                        offset = msg.offset,
                        attempt,
                        ?backoff,
                        error = %e,
                        "write failed, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(Outcome::Cancelled),
                        _ = sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn reject(
        &self,
        msg: &TopicMessage,
        stage: Stage,
        error: String,
    ) -> Result<Outcome, ConsumerError> {
        warn!(
            partition = msg.partition,
            offset = msg.offset,
            ?stage,
            %error,
            "dead-lettering message"
        );
        let letter = DeadLetter {
            topic: self.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
            stage,
            error,
            timestamp: Utc::now(),
            payload: msg.payload.clone().unwrap_or_default(),
        };
        self.dead_letter.send(&letter).await?;
        Ok(Outcome::DeadLettered)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::stream;

    use super::*;
    use crate::{
        checkpoint::MemoryCheckpointStore,
        codec::json,
        dead_letter::MemoryDeadLetter,
        record::{sample, UserRecord},
        sink::memory::MemoryStore,
    };

    struct Fixture {
        sink: Arc<MemoryStore>,
        checkpoints: Arc<MemoryCheckpointStore>,
        dlq: Arc<MemoryDeadLetter>,
        ingester: Arc<Ingester>,
    }

    fn fixture(max_retries: usize) -> Fixture {
        let sink = Arc::new(MemoryStore::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let dlq = Arc::new(MemoryDeadLetter::new());
        let retry = RetryPolicy {
            max_retries,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        };
        let ingester = Arc::new(Ingester::new(
            "users_created",
            Arc::new(json::Codec),
            sink.clone(),
            checkpoints.clone(),
            dlq.clone(),
            retry,
        ));
        Fixture {
            sink,
            checkpoints,
            dlq,
            ingester,
        }
    }

    fn encoded(r: &UserRecord) -> Vec<u8> {
        json::Codec.encode(r).unwrap()
    }

    fn msgs(partition: Partition, payloads: Vec<Vec<u8>>) -> Vec<Result<TopicMessage, KafkaError>> {
        payloads
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                Ok(TopicMessage {
                    partition,
                    offset: i as Offset,
                    payload: Some(p),
                })
            })
            .collect()
    }

    #[tokio::test]
    async fn writes_and_checkpoints_in_order() {
        let f = fixture(0);
        let input = msgs(0, vec![encoded(&sample("a")), encoded(&sample("b"))]);
        let summary = f
            .ingester
            .run_partition(0, None, stream::iter(input), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.written, 2);
        assert_eq!(summary.checkpoint, Some(1));
        assert_eq!(f.checkpoints.get("users_created", 0), Some(1));
        assert_eq!(f.sink.rows().len(), 2);
    }

    #[tokio::test]
    async fn bad_messages_are_dead_lettered_and_skipped() {
        let f = fixture(0);
        let mut v = serde_json::to_value(sample("bad")).unwrap();
        v.as_object_mut().unwrap().remove("last_name");
        let input = msgs(
            3,
            vec![
                b"not json".to_vec(),
                serde_json::to_vec(&v).unwrap(),
                encoded(&sample("good")),
            ],
        );
        let summary = f
            .ingester
            .run_partition(3, None, stream::iter(input), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!((summary.written, summary.dead_lettered), (1, 2));
        assert_eq!(summary.checkpoint, Some(2));
        let letters = f.dlq.letters();
        assert_eq!(letters[0].stage, Stage::Decode);
        assert_eq!(letters[1].stage, Stage::Schema);
        assert!(letters[1].error.contains("last_name"));
        assert_eq!(f.sink.get("bad").await.unwrap(), None);
    }

    #[tokio::test]
    async fn tombstone_is_a_decode_failure() {
        let f = fixture(0);
        let input = vec![Ok(TopicMessage {
            partition: 0,
            offset: 0,
            payload: None,
        })];
        f.ingester
            .run_partition(0, None, stream::iter(input), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(f.dlq.letters()[0].stage, Stage::Decode);
        assert!(f.dlq.letters()[0].payload.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let f = fixture(3);
        f.sink.fail_next([
            WriteError::Transient("conn reset".into()),
            WriteError::Transient("timeout".into()),
        ]);
        let input = msgs(0, vec![encoded(&sample("a"))]);
        let summary = f
            .ingester
            .run_partition(0, None, stream::iter(input), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.written, 1);
        assert_eq!(f.sink.attempts(), 3);
        assert!(f.dlq.letters().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_goes_to_dead_letter() {
        let f = fixture(3);
        f.sink.fail_next([WriteError::Permanent("type mismatch".into())]);
        let input = msgs(0, vec![encoded(&sample("a")), encoded(&sample("b"))]);
        let summary = f
            .ingester
            .run_partition(0, None, stream::iter(input), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!((summary.written, summary.dead_lettered), (1, 1));
        assert_eq!(f.dlq.letters()[0].stage, Stage::Write);
        assert_eq!(f.sink.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_stop_the_partition_without_advancing() {
        let f = fixture(2);
        f.sink
            .fail_next(std::iter::repeat(WriteError::Transient("down".into())).take(3));
        let input = msgs(0, vec![encoded(&sample("a")), encoded(&sample("b"))]);
        let err = f
            .ingester
            .run_partition(0, None, stream::iter(input), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConsumerError::RetriesExhausted {
                offset: 0,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(f.checkpoints.get("users_created", 0), None);
        assert_eq!(f.sink.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn redelivered_offsets_are_skipped() {
        let f = fixture(0);
        let input = msgs(0, vec![encoded(&sample("a")), encoded(&sample("b"))]);
        f.checkpoints
            .compare_and_set("users_created", 0, None, 0)
            .await
            .unwrap();
        let summary = f
            .ingester
            .run_partition(0, Some(0), stream::iter(input), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!((summary.skipped, summary.written), (1, 1));
        assert_eq!(f.sink.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancelled_before_start_processes_nothing() {
        let f = fixture(0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let input = msgs(0, vec![encoded(&sample("a"))]);
        let summary = f
            .ingester
            .run_partition(0, None, stream::iter(input), cancel)
            .await
            .unwrap();
        assert_eq!(summary, PartitionSummary {
            partition: 0,
            ..Default::default()
        });
        assert_eq!(f.sink.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_leaves_checkpoint_alone() {
        let f = fixture(10);
        f.sink
            .fail_next(std::iter::repeat(WriteError::Transient("down".into())).take(10));
        let cancel = CancellationToken::new();
        let input = msgs(0, vec![encoded(&sample("a"))]);
        let ingester = f.ingester.clone();
        let token = cancel.clone();
        let worker = tokio::spawn(async move {
            ingester
                .run_partition(0, None, stream::iter(input), token)
                .await
        });
        sleep(Duration::from_millis(25)).await;
        cancel.cancel();
        let summary = worker.await.unwrap().unwrap();
        assert_eq!(summary.checkpoint, None);
        assert_eq!(f.checkpoints.get("users_created", 0), None);
        assert!(f.dlq.letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_partition_stops_the_others() {
        let f = fixture(0);
        f.sink.fail_next([WriteError::Transient("down".into())]);
        let failing = stream::iter(msgs(0, vec![encoded(&sample("a"))])).boxed();
        // never ends on its own
        let endless = stream::iter(msgs(1, vec![encoded(&sample("b"))]))
            .chain(stream::pending())
            .boxed();
        let err = f
            .ingester
            .clone()
            .run(vec![(0, failing), (1, endless)], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::RetriesExhausted { partition: 0, .. }));
        assert_eq!(f.checkpoints.get("users_created", 0), None);
    }

    struct BrokenDeadLetter;

    #[async_trait]
    impl DeadLetterSink for BrokenDeadLetter {
        async fn send(&self, _: &DeadLetter) -> Result<(), DeadLetterError> {
            Err(DeadLetterError::Kafka {
                topic: String::from("users_created.dlq"),
                reason: String::from("broker unreachable"),
            })
        }
    }

    #[tokio::test]
    async fn failed_dead_letter_is_fatal_and_keeps_position() {
        let f = fixture(0);
        let ingester = Ingester::new(
            "users_created",
            Arc::new(json::Codec),
            f.sink.clone(),
            f.checkpoints.clone(),
            Arc::new(BrokenDeadLetter),
            RetryPolicy::default(),
        );
        let input = msgs(0, vec![b"not json".to_vec(), encoded(&sample("a"))]);
        let err = ingester
            .run_partition(0, None, stream::iter(input), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::DeadLetter(_)));
        assert_eq!(f.checkpoints.get("users_created", 0), None);
        assert_eq!(f.sink.attempts(), 0);
    }

    #[tokio::test]
    async fn checkpoint_conflict_is_fatal() {
        let f = fixture(0);
        // another owner already moved this partition
        f.checkpoints
            .compare_and_set("users_created", 0, None, 10)
            .await
            .unwrap();
        let input = msgs(0, vec![encoded(&sample("a")), encoded(&sample("b"))]);
        let err = f
            .ingester
            .run_partition(0, None, stream::iter(input), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConsumerError::Checkpoint(CheckpointError::Conflict { found: Some(10), .. })
        ));
        assert_eq!(f.sink.attempts(), 1);
        assert_eq!(f.sink.get("b").await.unwrap(), None);
        assert_eq!(f.checkpoints.get("users_created", 0), Some(10));
    }

    #[tokio::test]
    async fn gap_after_checkpoint_is_counted() {
        let f = fixture(0);
        f.checkpoints
            .compare_and_set("users_created", 0, None, 1)
            .await
            .unwrap();
        let input = vec![Ok(TopicMessage {
            partition: 0,
            offset: 7,
            payload: Some(encoded(&sample("a"))),
        })];
        let summary = f
            .ingester
            .run_partition(0, Some(1), stream::iter(input), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!((summary.gaps, summary.written), (1, 1));
        assert_eq!(summary.checkpoint, Some(7));
    }
}
