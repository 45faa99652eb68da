use std::{sync::Arc, time::Duration};

use futures::stream::{self, BoxStream, StreamExt};
use rdkafka::error::KafkaError;
use tokio_util::sync::CancellationToken;
use userstream::{
    checkpoint::{CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore},
    codec::{get_codec, Codec},
    dead_letter::{DeadLetterSink, FileDeadLetter, MemoryDeadLetter, Stage},
    ingester::{ConsumerError, Ingester, TopicMessage},
    record::UserRecord,
    retry::RetryPolicy,
    sink::{memory::MemoryStore, RecordSink, WriteError},
};

const TOPIC: &str = "users_created";

type Messages = BoxStream<'static, Result<TopicMessage, KafkaError>>;

fn ada(id: &str) -> UserRecord {
    UserRecord {
        id: id.to_owned(),
        first_name: "Ada".to_owned(),
        last_name: "Lovelace".to_owned(),
        gender: "female".to_owned(),
        address: "12 St James's Square, London, Greater London, United Kingdom".to_owned(),
        post_code: "SW1Y 4JH".to_owned(),
        email: "ada@x.io".to_owned(),
        username: "countess".to_owned(),
        date_of_birth: Some("1815-12-10T00:00:00.000Z".to_owned()),
        registered_date: "1833-06-05T00:00:00.000Z".to_owned(),
        phone: "020 7946 0000".to_owned(),
        picture_url: "https://randomuser.me/api/portraits/med/women/1.jpg".to_owned(),
    }
}

fn retry(max_retries: usize) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        backoff_multiplier: 2.0,
    }
}

fn ingester(
    codec: &str,
    sink: Arc<dyn RecordSink>,
    checkpoints: Arc<dyn CheckpointStore>,
    dead_letter: Arc<dyn DeadLetterSink>,
    max_retries: usize,
) -> Arc<Ingester> {
    Arc::new(Ingester::new(
        TOPIC,
        get_codec(codec).unwrap(),
        sink,
        checkpoints,
        dead_letter,
        retry(max_retries),
    ))
}

fn partition(p: i32, payloads: &[Vec<u8>]) -> Messages {
    let msgs: Vec<_> = payloads
        .iter()
        .enumerate()
        .map(|(i, payload)| {
            Ok(TopicMessage {
                partition: p,
                offset: i as i64,
                payload: Some(payload.clone()),
            })
        })
        .collect();
    stream::iter(msgs).boxed()
}

fn encode(codec: &str, r: &UserRecord) -> Vec<u8> {
    get_codec(codec).unwrap().encode(r).unwrap()
}

#[tokio::test]
async fn single_record_lands_exactly_once() {
    for codec in ["json", "avro"] {
        let sink = Arc::new(MemoryStore::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let dlq = Arc::new(MemoryDeadLetter::new());
        let c = ingester(codec, sink.clone(), checkpoints.clone(), dlq.clone(), 0);

        let msg = encode(codec, &ada("u1"));
        c.clone()
            .run(vec![(0, partition(0, &[msg.clone()]))], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(sink.count().await.unwrap(), 1, "{codec}");
        let row = sink.get("u1").await.unwrap().unwrap();
        assert_eq!(row.first_name, "Ada");
        assert_eq!(row.email, "ada@x.io");

        // the same message published again, at the next offset
        let summaries = c
            .run(
                vec![(0, partition(0, &[msg.clone(), msg]))],
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!((summaries[0].skipped, summaries[0].written), (1, 1));
        assert_eq!(sink.count().await.unwrap(), 1);
        assert_eq!(sink.get("u1").await.unwrap(), Some(row));
        assert_eq!(checkpoints.get(TOPIC, 0), Some(1));
        assert!(dlq.letters().is_empty());
    }
}

#[tokio::test]
async fn invalid_record_is_dead_lettered_and_consumption_continues() {
    let sink = Arc::new(MemoryStore::new());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let dlq = Arc::new(MemoryDeadLetter::new());
    let c = ingester("json", sink.clone(), checkpoints.clone(), dlq.clone(), 0);

    let mut missing = serde_json::to_value(ada("u2")).unwrap();
    missing.as_object_mut().unwrap().remove("last_name");
    let bad = serde_json::to_vec(&missing).unwrap();
    let input = partition(0, &[bad.clone(), encode("json", &ada("u3"))]);
    c.run(vec![(0, input)], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(sink.get("u2").await.unwrap(), None);
    assert!(sink.get("u3").await.unwrap().is_some());
    let letters = dlq.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].stage, Stage::Schema);
    assert_eq!(letters[0].offset, 0);
    assert_eq!(letters[0].payload, bad);
    assert!(letters[0].error.contains("last_name"));
    assert_eq!(checkpoints.get(TOPIC, 0), Some(1));
}

#[tokio::test]
async fn restart_resumes_after_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let cp_path = dir.path().join("checkpoint.json");
    let payloads: Vec<_> = (0..6)
        .map(|i| encode("json", &ada(&format!("u{i}"))))
        .collect();

    // first run stops after offset 2
    let sink = Arc::new(MemoryStore::new());
    let dlq = Arc::new(FileDeadLetter::new(dir.path().join("dlq.jsonl")));
    let checkpoints = Arc::new(FileCheckpointStore::open(&cp_path).await.unwrap());
    let c = ingester("json", sink.clone(), checkpoints, dlq.clone(), 0);
    c.run(vec![(0, partition(0, &payloads[..3]))], CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(sink.count().await.unwrap(), 3);
    let attempts_before = sink.attempts();

    // restarted process with a fresh store handle redelivers from the start
    let checkpoints = Arc::new(FileCheckpointStore::open(&cp_path).await.unwrap());
    assert_eq!(checkpoints.load(TOPIC).await.unwrap().get(&0), Some(&2));
    let c = ingester("json", sink.clone(), checkpoints.clone(), dlq.clone(), 0);
    let summaries = c
        .run(vec![(0, partition(0, &payloads))], CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summaries[0].skipped, 3);
    assert_eq!(summaries[0].written, 3);
    assert_eq!(sink.attempts() - attempts_before, 3);

    // same state as a single uninterrupted pass
    let single = Arc::new(MemoryStore::new());
    let c = ingester(
        "json",
        single.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(MemoryDeadLetter::new()),
        0,
    );
    c.run(vec![(0, partition(0, &payloads))], CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(sink.rows(), single.rows());
    assert_eq!(checkpoints.load(TOPIC).await.unwrap().get(&0), Some(&5));
    assert!(dlq.read_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn partitions_checkpoint_independently() {
    let sink = Arc::new(MemoryStore::new());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let c = ingester(
        "json",
        sink.clone(),
        checkpoints.clone(),
        Arc::new(MemoryDeadLetter::new()),
        0,
    );
    let p0: Vec<_> = (0..4).map(|i| encode("json", &ada(&format!("a{i}")))).collect();
    let p1: Vec<_> = (0..2).map(|i| encode("json", &ada(&format!("b{i}")))).collect();
    let summaries = c
        .run(
            vec![(0, partition(0, &p0)), (1, partition(1, &p1))],
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(checkpoints.get(TOPIC, 0), Some(3));
    assert_eq!(checkpoints.get(TOPIC, 1), Some(1));
    assert_eq!(sink.count().await.unwrap(), 6);
}

#[tokio::test]
async fn checkpoints_never_move_backwards() {
    let store = MemoryCheckpointStore::new();
    store.compare_and_set(TOPIC, 0, None, 10).await.unwrap();
    let err = store
        .compare_and_set(TOPIC, 0, Some(10), 9)
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::Regression { .. }));
    let err = store.compare_and_set(TOPIC, 0, None, 11).await.unwrap_err();
    assert!(matches!(err, CheckpointError::Conflict { .. }));
    assert_eq!(store.get(TOPIC, 0), Some(10));
}

#[tokio::test]
async fn unavailable_store_is_fatal_and_keeps_position() {
    let sink = Arc::new(MemoryStore::new());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let dlq = Arc::new(MemoryDeadLetter::new());
    let c = ingester("json", sink.clone(), checkpoints.clone(), dlq.clone(), 3);

    let first = encode("json", &ada("u1"));
    let second = encode("json", &ada("u2"));
    c.clone()
        .run(vec![(0, partition(0, &[first.clone()]))], CancellationToken::new())
        .await
        .unwrap();

    sink.fail_next(std::iter::repeat(WriteError::Transient("connection refused".into())).take(4));
    let err = c
        .run(
            vec![(0, partition(0, &[first, second]))],
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    match err {
        ConsumerError::RetriesExhausted {
            offset, attempts, ..
        } => assert_eq!((offset, attempts), (1, 4)),
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(checkpoints.get(TOPIC, 0), Some(0));
    assert_eq!(sink.get("u2").await.unwrap(), None);
    assert!(dlq.letters().is_empty());
}

#[tokio::test]
async fn rejected_write_is_dead_lettered() {
    let sink = Arc::new(MemoryStore::new());
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let dlq = Arc::new(MemoryDeadLetter::new());
    let c = ingester("json", sink.clone(), checkpoints.clone(), dlq.clone(), 3);

    sink.fail_next([WriteError::Permanent("value too long".into())]);
    let input = partition(
        0,
        &[encode("json", &ada("u1")), encode("json", &ada("u2"))],
    );
    c.run(vec![(0, input)], CancellationToken::new())
        .await
        .unwrap();
    let letters = dlq.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].stage, Stage::Write);
    assert_eq!(letters[0].error, "value too long");
    assert_eq!(sink.get("u1").await.unwrap(), None);
    assert!(sink.get("u2").await.unwrap().is_some());
    assert_eq!(checkpoints.get(TOPIC, 0), Some(1));
}

#[tokio::test]
async fn codec_mismatch_is_a_decode_failure() {
    let sink = Arc::new(MemoryStore::new());
    let dlq = Arc::new(MemoryDeadLetter::new());
    let c = ingester(
        "avro",
        sink.clone(),
        Arc::new(MemoryCheckpointStore::new()),
        dlq.clone(),
        0,
    );
    c.run(
        vec![(0, partition(0, &[encode("json", &ada("u1"))]))],
        CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(sink.count().await.unwrap(), 0);
    assert_eq!(dlq.letters()[0].stage, Stage::Decode);
}
